//! Logging integration: debug-mode runs emit node output shapes, and the
//! global subscriber can mirror events into a JSON log file.

mod common;

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use common::*;
use graphforge::logging::{self, LogLevel, LoggingConfig};
use graphforge::RunOptions;

/// In-memory writer shared with the test
#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn captured<F: FnOnce()>(f: F) -> String {
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    capture.contents()
}

#[test]
#[serial]
fn test_debug_mode_logs_output_shapes() {
    let session = cpu_session(chain_graph());
    let feeds = feed(&session, [2, 3], &[1.0; 6]);

    let logs = captured(|| {
        let options = RunOptions::new().with_tag("shapes").with_debug_mode(true);
        session.run_with_options(&options, &feeds, &["y"]).unwrap();
    });
    assert!(logs.contains("relu (Relu:"), "{}", logs);
    assert!(logs.contains("output #"), "{}", logs);
    assert!(logs.contains("float32 [2, 3]"), "{}", logs);
}

#[test]
#[serial]
fn test_plain_run_skips_shape_dump() {
    let session = cpu_session(chain_graph());
    let feeds = feed(&session, [4], &[1.0; 4]);

    let logs = captured(|| {
        session.run(&feeds, &["y"]).unwrap();
    });
    assert!(!logs.contains("output #"), "{}", logs);
}

#[test]
#[serial]
fn test_global_subscriber_writes_json_file() {
    let dir = create_temp_dir().unwrap();
    let path = dir.path().join("logs").join("graphforge.jsonl");

    std::env::remove_var("RUST_LOG");
    logging::init_with_config(&LoggingConfig::new().with_level(LogLevel::Info).with_log_file(&path));
    assert!(logging::is_initialized());
    // A second install is a no-op
    logging::init_logging_default();

    let session = cpu_session(chain_graph());
    session.run(&feed(&session, [1], &[1.0]), &["y"]).unwrap();
    drop(session);

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert!(!lines.is_empty());
    for line in lines {
        let event: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(event.get("level").is_some());
    }
    assert!(contents.contains("Creating session"));
}
