use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use graphforge::graph::demo;
use graphforge::logging::{self, LogLevel, LoggingConfig};
use graphforge::{
    CpuExecutionProvider, CpuProviderConfig, InferenceSession, RunOptions, SessionOptions,
    StreamExecutionProvider, StreamProviderConfig, Tensor, Value,
};

#[derive(Parser, Debug)]
#[command(name = "graphforge-cli", version)]
#[command(about = "Plan and run graphs with graphforge", long_about = None)]
struct Cli {
    /// Log level (overrides GRAPHFORGE_LOG_LEVEL)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Provider {
    Cpu,
    Stream,
}

#[derive(clap::Args, Debug)]
struct GraphArgs {
    /// Execution providers in priority order
    #[arg(long = "provider", value_enum, default_values_t = [Provider::Cpu])]
    providers: Vec<Provider>,
    /// Session options as JSON
    #[arg(long)]
    options: Option<PathBuf>,
    /// Width of the demo model input
    #[arg(long, default_value_t = 16)]
    input_dim: usize,
    /// Hidden layer width of the demo model
    #[arg(long, default_value_t = 32)]
    hidden: usize,
    /// Output classes of the demo model
    #[arg(long, default_value_t = 4)]
    classes: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the demo MLP and report timings and memory use
    Run {
        #[command(flatten)]
        graph: GraphArgs,
        /// Rows per input batch
        #[arg(long, default_value_t = 8)]
        batch: usize,
        /// Runs per thread
        #[arg(long, default_value_t = 10)]
        iterations: usize,
        /// Threads running concurrently
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        /// Log every node output shape
        #[arg(long)]
        debug: bool,
    },
    /// Print the allocation plan of the demo MLP
    Plan {
        #[command(flatten)]
        graph: GraphArgs,
    },
}

fn build_session(args: &GraphArgs) -> anyhow::Result<InferenceSession> {
    let mut options = match &args.options {
        Some(path) => SessionOptions::from_json_file(path)
            .with_context(|| format!("loading session options from {}", path.display()))?,
        None => SessionOptions::new().with_logid("cli"),
    };
    if options.provider_priority.is_none() {
        options.provider_priority = Some(
            args.providers
                .iter()
                .map(|p| match p {
                    Provider::Cpu => graphforge::ProviderType::CPU,
                    Provider::Stream => graphforge::ProviderType::STREAM,
                })
                .collect(),
        );
    }

    let mut session = InferenceSession::new(options);
    for provider in &args.providers {
        match provider {
            Provider::Cpu => session.register_execution_provider(Arc::new(CpuExecutionProvider::new(
                CpuProviderConfig::new(),
            )?))?,
            Provider::Stream => session.register_execution_provider(Arc::new(StreamExecutionProvider::new(
                StreamProviderConfig::new(),
            )?))?,
        }
    }
    session.load(demo::mlp(args.input_dim, args.hidden, args.classes)?)?;
    session.initialize()?;
    Ok(session)
}

fn input_feeds(session: &InferenceSession, batch: usize, input_dim: usize) -> anyhow::Result<HashMap<String, Value>> {
    let allocator = session.host_allocator()?;
    let data: Vec<f32> = (0..batch * input_dim).map(|i| (i % 5) as f32 * 0.25).collect();
    let x = Tensor::from_vec(allocator.as_ref(), [batch, input_dim], &data)?;
    Ok(HashMap::from([("x".to_string(), Value::from_tensor(x))]))
}

fn print_memory(session: &InferenceSession) -> anyhow::Result<()> {
    let state = session.state()?;
    for provider in state.providers().iter() {
        for allocator in provider.allocators() {
            println!("  {:<28} {}", allocator.info().to_string(), allocator.stats());
        }
    }
    Ok(())
}

fn run(
    args: &GraphArgs,
    batch: usize,
    iterations: usize,
    concurrency: usize,
    debug: bool,
) -> anyhow::Result<()> {
    if concurrency == 0 || iterations == 0 {
        bail!("iterations and concurrency must be positive");
    }
    let session = build_session(args)?;
    let feeds = input_feeds(&session, batch, args.input_dim)?;
    let run_options = RunOptions::new().with_tag("cli").with_debug_mode(debug);

    let first = session.run_with_options(&run_options, &feeds, &["y"])?;
    let y = first[0]
        .tensor()
        .context("output y is not a tensor")?
        .to_vec::<f32>()?;
    println!("y[0..{}] = {:?}", args.classes, &y[..args.classes.min(y.len())]);

    let started = Instant::now();
    std::thread::scope(|scope| -> anyhow::Result<()> {
        let workers: Vec<_> = (0..concurrency)
            .map(|_| {
                scope.spawn(|| -> anyhow::Result<()> {
                    for _ in 0..iterations {
                        session.run_with_options(&run_options, &feeds, &["y"])?;
                    }
                    Ok(())
                })
            })
            .collect();
        for worker in workers {
            match worker.join() {
                Ok(result) => result?,
                Err(_) => bail!("worker thread panicked"),
            }
        }
        Ok(())
    })?;
    let elapsed = started.elapsed();
    let runs = iterations * concurrency;
    println!(
        "{} runs on {} threads in {:.2?} ({:.1} µs/run)",
        runs,
        concurrency,
        elapsed,
        elapsed.as_secs_f64() * 1e6 / runs as f64
    );
    println!("memory:");
    print_memory(&session)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut log_config = LoggingConfig::from_env();
    if let Some(level) = &cli.log_level {
        let level = LogLevel::parse(level).with_context(|| format!("unknown log level '{}'", level))?;
        log_config = log_config.with_level(level);
    }
    logging::init_with_config(&log_config);

    match cli.command {
        Commands::Run {
            graph,
            batch,
            iterations,
            concurrency,
            debug,
        } => run(&graph, batch, iterations, concurrency, debug),
        Commands::Plan { graph } => {
            let session = build_session(&graph)?;
            print!("{}", session.describe_plan()?);
            Ok(())
        }
    }
}
