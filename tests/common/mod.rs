//! Common test utilities for graphforge integration tests
//!
//! Shared fixtures build sessions over the CPU and stream providers, create
//! host feeds, and read outputs back. Tests touching global logging state
//! run under `#[serial]`.
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::*;
//!
//! #[test]
//! fn my_test() {
//!     let session = cpu_session(chain_graph());
//!     let outputs = session.run(&feed(&session, [2], &[1.0, -1.0]), &["y"]).unwrap();
//!     assert_eq!(f32_output(&outputs, 0).len(), 2);
//! }
//! ```

#![allow(dead_code)]

mod fixtures;
mod tempfile_helpers;

pub use fixtures::*;
pub use serial_test::serial;
pub use tempfile_helpers::*;
