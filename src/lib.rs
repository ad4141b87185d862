//! graphforge - dataflow graph executor
//!
//! Runs a static graph of operators over tensors and non-tensor values on
//! one or more execution providers. Before the first run the session
//! partitions the graph across providers, picks a kernel for every node from
//! layered registries, and computes an allocation plan that lets kernels
//! write in place over inputs whose lifetime ends at that node. Values
//! crossing an asynchronous device are ordered by fences.

#![allow(clippy::new_without_default)] // Builders mirror `Default` explicitly where it matters
#![allow(clippy::len_without_is_empty)] // Small index types expose len() only

pub mod error;
pub mod executor;
pub mod graph;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod ops;
pub mod plan;
pub mod provider;
pub mod session;
pub mod tensor;
pub mod value;

#[doc(hidden)]
pub use tracing as __tracing;

pub use error::{ForgeError, ForgeResult, StatusKind};
pub use executor::{ExecutionFrame, KernelContext, SequentialExecutor};
pub use graph::{Graph, GraphBuilder, Node};
pub use kernel::{KernelDef, KernelDefBuilder, KernelRegistry, OpKernel};
pub use memory::{Allocator, AllocatorInfo, ArenaStats};
pub use plan::{AllocKind, AllocationPlan, ExecutionPlan};
pub use provider::cpu::{CpuExecutionProvider, CpuProviderConfig};
pub use provider::stream::{StreamExecutionProvider, StreamProviderConfig};
pub use provider::{ExecutionProvider, Fence, ProviderType};
pub use session::{InferenceSession, RunOptions, SessionOptions};
pub use tensor::{DataType, Tensor, TensorShape};
pub use value::{NonTensorValue, Value, ValueType};
