//! Tensor entity owned by a graph: shape, identity, edges, bound storage.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::graph::OpId;
use crate::runtime::RuntimeRef;
use crate::tensor::{DType, Shape};

/// Family identifier: shared by clones of the same logical tensor and unique
/// within any single graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TensorId(pub u32);

static FUID_COUNTER: AtomicU32 = AtomicU32::new(0);
static GUID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_fuid() -> TensorId {
    TensorId(FUID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn next_guid() -> u64 {
    GUID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// View into the graph arena bound to a tensor during memory planning.
///
/// The view is non-owning: the arena belongs to the graph's allocator and
/// outlives every view handed out for it.
#[derive(Debug, Clone)]
pub struct StorageView {
    runtime: RuntimeRef,
    ptr: NonNull<u8>,
}

impl StorageView {
    pub(crate) fn new(runtime: RuntimeRef, ptr: NonNull<u8>) -> Self {
        StorageView { runtime, ptr }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn runtime(&self) -> &RuntimeRef {
        &self.runtime
    }
}

pub struct Tensor {
    fuid: TensorId,
    guid: u64,
    shape: Shape,
    dtype: DType,
    /// Cached element count, kept in sync with `shape`.
    size: usize,
    runtime: RuntimeRef,
    source: Option<OpId>,
    targets: SmallVec<[OpId; 4]>,
    data: Option<StorageView>,
}

impl Tensor {
    /// Constructs a detached tensor with a fresh family id and no edges.
    pub fn new(shape: Shape, dtype: DType, runtime: RuntimeRef) -> Self {
        let size = shape.num_elements();
        Tensor {
            fuid: next_fuid(),
            guid: next_guid(),
            shape,
            dtype,
            size,
            runtime,
            source: None,
            targets: SmallVec::new(),
            data: None,
        }
    }

    /// Clones this tensor's identity and metadata without its edges or
    /// storage. The clone shares the family id; edges belong to a graph
    /// context, not to the tensor itself.
    pub fn clone_family(&self) -> Tensor {
        Tensor {
            fuid: self.fuid,
            guid: next_guid(),
            shape: self.shape.clone(),
            dtype: self.dtype,
            size: self.size,
            runtime: self.runtime.clone(),
            source: None,
            targets: SmallVec::new(),
            data: None,
        }
    }

    pub fn fuid(&self) -> TensorId {
        self.fuid
    }

    /// Globally unique id for diagnostic printing only.
    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Replaces the shape and refreshes the cached element count. Used by
    /// shape inference when an upstream rewrite changed a producer.
    pub fn set_shape(&mut self, shape: Shape) {
        self.size = shape.num_elements();
        self.shape = shape;
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Element count.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Total storage footprint in bytes.
    pub fn bytes(&self) -> usize {
        self.size * self.dtype.size_in_bytes()
    }

    pub fn runtime(&self) -> &RuntimeRef {
        &self.runtime
    }

    /// The operator producing this tensor, absent for graph inputs.
    pub fn source(&self) -> Option<OpId> {
        self.source
    }

    /// The operators consuming this tensor, in registration order. An
    /// operator using the tensor more than once appears once per use.
    pub fn targets(&self) -> &[OpId] {
        &self.targets
    }

    pub fn has_storage(&self) -> bool {
        self.data.is_some()
    }

    pub fn storage(&self) -> Option<&StorageView> {
        self.data.as_ref()
    }

    /// Raw base address of the bound storage.
    ///
    /// Panics when storage has not been bound yet; callers must run memory
    /// planning first.
    pub fn raw_ptr(&self) -> *mut u8 {
        self.data
            .as_ref()
            .expect("tensor storage is unbound, run memory planning first")
            .as_ptr()
    }

    pub(crate) fn set_source(&mut self, op: OpId) {
        self.source = Some(op);
    }

    pub(crate) fn clear_source(&mut self) {
        self.source = None;
    }

    pub(crate) fn add_target(&mut self, op: OpId) {
        self.targets.push(op);
    }

    /// Removes every occurrence of `op` from the target list.
    pub(crate) fn remove_target(&mut self, op: OpId) {
        self.targets.retain(|id| *id != op);
    }

    /// Binds the storage view produced by memory planning. Binding is
    /// one-shot; the view lives until graph teardown.
    pub(crate) fn bind_storage(&mut self, view: StorageView) {
        assert!(self.data.is_none(), "tensor storage is already bound");
        self.data = Some(view);
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor {}, Fuid {}, shape {}, dtype {}",
            self.guid, self.fuid.0, self.shape, self.dtype
        )
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("fuid", &self.fuid)
            .field("guid", &self.guid)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("source", &self.source)
            .field("targets", &self.targets)
            .field("bound", &self.data.is_some())
            .finish()
    }
}
