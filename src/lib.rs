//! In-memory planning core for a small tensor-graph inference runtime.
//!
//! Given a computation described as a DAG of tensors and operators, the crate
//! validates the graph, infers shapes, applies local algebraic rewrites, and
//! lays every tensor out in a single contiguous arena before any real memory
//! is requested from the device.
//!
//! ```text
//! Graph (graph/)            owns tensors + operators, keeps edges consistent
//!   |-- passes (passes/)    transpose cancellation, matmul folding
//!   |-- ArenaAllocator      offset planning, coalescing free list
//!   `-- Runtime (runtime)   opaque alloc/dealloc collaborator
//! ```
//!
//! Kernel execution, data movement, and I/O are out of scope; the runtime is
//! only ever asked for one backing allocation per graph, sized to the peak
//! footprint the allocator observed during planning.

mod error;
pub mod graph;
pub mod passes;
pub mod runtime;
pub mod tensor;

pub use error::{Error, Result};
pub use graph::{Graph, MemoryInfo, OpId, OpKind, Operator, Tensor, TensorId};
pub use runtime::{CpuRuntime, Runtime, RuntimeRef};
pub use tensor::{DType, Element, Shape};
