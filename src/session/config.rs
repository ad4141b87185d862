//! Session and run options
//!
//! [`SessionOptions`] are fixed when the session is created; [`RunOptions`]
//! apply to a single `run` call. Both can be loaded from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, ForgeResult};
use crate::provider::ProviderType;

/// Options controlling how a session plans and executes its graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Identifier attached to every run span
    pub session_logid: String,

    /// Only sequential execution is supported; `false` fails at initialize
    pub enable_sequential_execution: bool,

    /// Let the planner run eligible kernels in place
    pub enable_memory_reuse: bool,

    /// Explicit partitioning order; registration order when unset
    pub provider_priority: Option<Vec<ProviderType>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            session_logid: String::new(),
            enable_sequential_execution: true,
            enable_memory_reuse: true,
            provider_priority: None,
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logid(mut self, logid: impl Into<String>) -> Self {
        self.session_logid = logid.into();
        self
    }

    pub fn with_sequential_execution(mut self, enabled: bool) -> Self {
        self.enable_sequential_execution = enabled;
        self
    }

    pub fn with_memory_reuse(mut self, enabled: bool) -> Self {
        self.enable_memory_reuse = enabled;
        self
    }

    pub fn with_provider_priority<I>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = ProviderType>,
    {
        self.provider_priority = Some(order.into_iter().collect());
        self
    }

    /// Parse options from a JSON document; missing fields take defaults
    pub fn from_json_str(json: &str) -> ForgeResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| ForgeError::InvalidArgument(format!("invalid session options: {}", e)))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ForgeResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ForgeError::NotFound(format!("cannot read session options {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Reject option combinations the session cannot honour
    pub fn validate(&self) -> ForgeResult<()> {
        if !self.enable_sequential_execution {
            return Err(ForgeError::InvalidArgument(
                "parallel execution is not supported; set enable_sequential_execution".to_string(),
            ));
        }
        if let Some(order) = &self.provider_priority {
            for (i, provider) in order.iter().enumerate() {
                if order[..i].contains(provider) {
                    return Err(ForgeError::InvalidArgument(format!(
                        "provider {} appears twice in provider_priority",
                        provider
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Per-run options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Tag recorded on the run span
    pub run_tag: String,

    /// Log the dtype and shape of every node output
    pub enable_debug_mode: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.run_tag = tag.into();
        self
    }

    pub fn with_debug_mode(mut self, enabled: bool) -> Self {
        self.enable_debug_mode = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SessionOptions::default();
        assert!(options.enable_sequential_execution);
        assert!(options.enable_memory_reuse);
        assert!(options.provider_priority.is_none());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let options = SessionOptions::from_json_str(
            r#"{"session_logid": "bench", "provider_priority": ["StreamExecutionProvider", "CPUExecutionProvider"]}"#,
        )
        .unwrap();
        assert_eq!(options.session_logid, "bench");
        assert!(options.enable_memory_reuse);
        assert_eq!(
            options.provider_priority,
            Some(vec![ProviderType::STREAM, ProviderType::CPU])
        );
    }

    #[test]
    fn test_parallel_execution_rejected() {
        let options = SessionOptions::new().with_sequential_execution(false);
        assert!(matches!(options.validate(), Err(ForgeError::InvalidArgument(_))));
    }

    #[test]
    fn test_duplicate_priority_rejected() {
        let options = SessionOptions::new().with_provider_priority([ProviderType::CPU, ProviderType::CPU]);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        let err = SessionOptions::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ForgeError::InvalidArgument(_)));
    }

    #[test]
    fn test_run_options_builder() {
        let run = RunOptions::new().with_tag("warmup").with_debug_mode(true);
        assert_eq!(run.run_tag, "warmup");
        assert!(run.enable_debug_mode);
    }
}
