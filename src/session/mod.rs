//! Inference session
//!
//! A session owns a graph and the providers it runs on. Usage follows a
//! fixed lifecycle:
//!
//! 1. [`InferenceSession::new`] with [`SessionOptions`]
//! 2. optionally register execution providers and custom kernel registries
//! 3. [`InferenceSession::load`] a graph
//! 4. [`InferenceSession::initialize`] once: partitioning, kernel creation,
//!    memory planning and weight upload
//! 5. [`InferenceSession::run`] any number of times, from any number of
//!    threads
//!
//! # Example
//!
//! ```ignore
//! let mut session = InferenceSession::new(SessionOptions::default());
//! session.load(graph)?;
//! session.initialize()?;
//! let outputs = session.run(&feeds, &["y"])?;
//! ```

pub mod config;
pub mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{ForgeError, ForgeResult};
use crate::executor::SequentialExecutor;
use crate::graph::Graph;
use crate::kernel::KernelRegistry;
use crate::memory::{AllocatorInfo, AllocatorPtr};
use crate::plan::AllocKind;
use crate::provider::cpu::CpuExecutionProvider;
use crate::provider::{ProviderPtr, ProviderTable, ProviderType};
use crate::value::Value;

pub use config::{RunOptions, SessionOptions};
pub use state::SessionState;

/// Counts a run for as long as it is alive
struct RunGuard<'a>(&'a AtomicUsize);

impl<'a> RunGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Loads, initializes and runs one graph
pub struct InferenceSession {
    options: SessionOptions,
    providers: ProviderTable,
    custom_registries: Vec<Arc<KernelRegistry>>,
    graph: Option<Graph>,
    state: Option<SessionState>,
    current_num_runs: AtomicUsize,
}

impl InferenceSession {
    pub fn new(options: SessionOptions) -> Self {
        tracing::info!("Creating session '{}'", options.session_logid);
        Self {
            options,
            providers: ProviderTable::new(),
            custom_registries: Vec::new(),
            graph: None,
            state: None,
            current_num_runs: AtomicUsize::new(0),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    fn ensure_not_initialized(&self, what: &str) -> ForgeResult<()> {
        if self.is_initialized() {
            return Err(ForgeError::Fail(format!(
                "cannot {} after the session is initialized",
                what
            )));
        }
        Ok(())
    }

    /// Add an execution provider. Registration order is the default
    /// partitioning priority.
    pub fn register_execution_provider(&mut self, provider: ProviderPtr) -> ForgeResult<()> {
        self.ensure_not_initialized("register an execution provider")?;
        let provider_type = provider.provider_type().clone();
        self.providers.add(provider)?;
        tracing::info!("Registered execution provider {}", provider_type);
        Ok(())
    }

    /// Add a kernel registry searched before every provider's built-in one.
    /// Registries registered earlier take precedence.
    pub fn register_custom_registry(&mut self, registry: Arc<KernelRegistry>) -> ForgeResult<()> {
        self.ensure_not_initialized("register a kernel registry")?;
        tracing::info!("Registered custom kernel registry with {} kernels", registry.len());
        self.custom_registries.push(registry);
        Ok(())
    }

    pub fn load(&mut self, graph: Graph) -> ForgeResult<()> {
        self.ensure_not_initialized("load a graph")?;
        tracing::info!(
            "Loaded graph '{}': {} nodes, {} weights",
            graph.name(),
            graph.nodes().len(),
            graph.initializers().len()
        );
        self.graph = Some(graph);
        Ok(())
    }

    /// Prepare the loaded graph for execution. Fails when called twice.
    pub fn initialize(&mut self) -> ForgeResult<()> {
        if self.is_initialized() {
            return Err(ForgeError::Fail("session is already initialized".to_string()));
        }
        self.options.validate()?;
        let graph = self
            .graph
            .as_ref()
            .ok_or_else(|| ForgeError::Fail("no graph loaded".to_string()))?;

        if !self.providers.contains(&ProviderType::CPU) {
            let cpu = CpuExecutionProvider::new(Default::default())?;
            self.providers.add(Arc::new(cpu))?;
            tracing::debug!("CPU execution provider added implicitly");
        }

        let state = SessionState::build(
            graph,
            self.providers.clone(),
            &self.custom_registries,
            &self.options,
        )?;
        tracing::info!(
            "Session '{}' initialized: {} steps over {} providers",
            self.options.session_logid,
            state.plan().steps.len(),
            state.providers().len()
        );
        self.state = Some(state);
        Ok(())
    }

    /// State of an initialized session
    pub fn state(&self) -> ForgeResult<&SessionState> {
        self.state.as_ref().ok_or(ForgeError::NotInitialized)
    }

    /// Allocator for host tensors (feeds)
    pub fn host_allocator(&self) -> ForgeResult<AllocatorPtr> {
        let providers = match &self.state {
            Some(state) => state.providers().as_ref(),
            None => &self.providers,
        };
        providers
            .allocator_for(&AllocatorInfo::cpu())
            .cloned()
            .ok_or_else(|| ForgeError::NotFound("no host allocator registered".to_string()))
    }

    /// Number of runs in progress
    pub fn current_num_runs(&self) -> usize {
        self.current_num_runs.load(Ordering::SeqCst)
    }

    /// Plan listing of an initialized session
    pub fn describe_plan(&self) -> ForgeResult<String> {
        let state = self.state()?;
        Ok(state.plan().describe(state.value_map()))
    }

    pub fn run(&self, feeds: &HashMap<String, Value>, output_names: &[&str]) -> ForgeResult<Vec<Value>> {
        self.run_with_options(&RunOptions::default(), feeds, output_names)
    }

    /// Execute the graph. Outputs come back in the order of `output_names`;
    /// a name listed twice yields two handles to the same data.
    pub fn run_with_options(
        &self,
        run_options: &RunOptions,
        feeds: &HashMap<String, Value>,
        output_names: &[&str],
    ) -> ForgeResult<Vec<Value>> {
        let state = self.state()?;
        let _guard = RunGuard::new(&self.current_num_runs);
        let span = tracing::info_span!(
            "run",
            logid = %self.options.session_logid,
            tag = %run_options.run_tag
        );
        let _enter = span.enter();

        let graph = state.graph();
        let value_map = state.value_map();

        let fetch_ids = output_names
            .iter()
            .map(|name| {
                if !graph.is_graph_output(name) {
                    return Err(ForgeError::InvalidArgument(format!(
                        "'{}' is not an output of graph '{}'",
                        name,
                        graph.name()
                    )));
                }
                value_map.require(name)
            })
            .collect::<ForgeResult<Vec<_>>>()?;

        for name in feeds.keys() {
            if !graph.is_graph_input(name) {
                return Err(ForgeError::InvalidArgument(format!(
                    "'{}' is not an input of graph '{}'",
                    name,
                    graph.name()
                )));
            }
        }

        let mut frame = state.create_frame()?;
        for name in graph.inputs() {
            let feed = feeds
                .get(name)
                .ok_or_else(|| ForgeError::InvalidArgument(format!("missing feed for input '{}'", name)))?;
            let id = value_map.require(name)?;
            let entry = frame.plan().entry(id);
            debug_assert_eq!(entry.kind, AllocKind::PreExisting);
            if entry.value_type.is_tensor() != feed.is_tensor() {
                return Err(ForgeError::InvalidArgument(format!(
                    "input '{}' expects {}",
                    name, entry.value_type
                )));
            }
            frame.insert_preexisting(id, feed.detached())?;
        }

        tracing::debug!("Running {} steps, fetching {:?}", state.plan().steps.len(), output_names);
        let mut executor = SequentialExecutor::new(graph, state.plan(), state.kernels(), state.providers())
            .with_debug_mode(run_options.enable_debug_mode);
        executor.execute(&mut frame, &fetch_ids)
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        let providers = match &self.state {
            Some(state) => state.providers().as_ref(),
            None => &self.providers,
        };
        if let Err(err) = providers.synchronize_all() {
            tracing::warn!("Synchronize on session drop: {}", err);
        }
    }
}
