//! Mutable tensor/operator graph with connectivity maintenance.
//!
//! The graph is the sole owner of its tensors and operators; every
//! cross-reference between them is a plain id, so the rewriter can delete
//! either side without dangling ownership. Factories keep the bidirectional
//! tensor/operator relation consistent on insertion, and
//! [`Graph::disconnect_op`] runs the reverse wiring before an operator is
//! dropped.
//!
//! A typical session: build (`add_tensor` / `add_op`), `optimize`,
//! `shape_infer`, then `data_malloc`, which drives the arena allocator and
//! binds a storage view to every tensor.

pub mod arena;
pub mod op;
pub mod tensor;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::passes;
use crate::runtime::RuntimeRef;
use crate::tensor::{DType, Shape};

pub use arena::{ArenaAllocator, MemoryInfo};
pub use op::{OpId, OpKind, Operator};
pub use tensor::{StorageView, Tensor, TensorId};

pub struct Graph {
    runtime: RuntimeRef,
    tensors: Vec<Tensor>,
    ops: Vec<Operator>,
    allocator: ArenaAllocator,
    /// Whether `ops` is currently in topological order.
    sorted: bool,
}

impl Graph {
    pub fn new(runtime: RuntimeRef) -> Self {
        Graph {
            allocator: ArenaAllocator::new(runtime.clone()),
            runtime,
            tensors: Vec::new(),
            ops: Vec::new(),
            sorted: false,
        }
    }

    pub fn runtime(&self) -> &RuntimeRef {
        &self.runtime
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn ops(&self) -> &[Operator] {
        &self.ops
    }

    /// Looks up a tensor by family id. Panics when the id is not registered.
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        self.find_tensor(id).expect("tensor id must be registered")
    }

    pub(crate) fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        self.tensors
            .iter_mut()
            .find(|t| t.fuid() == id)
            .expect("tensor id must be registered")
    }

    pub fn find_tensor(&self, id: TensorId) -> Option<&Tensor> {
        self.tensors.iter().find(|t| t.fuid() == id)
    }

    /// Looks up an operator by id. Panics when the id is not registered.
    pub fn op(&self, id: OpId) -> &Operator {
        self.ops
            .iter()
            .find(|o| o.id() == id)
            .expect("operator id must be registered")
    }

    pub(crate) fn op_mut(&mut self, id: OpId) -> &mut Operator {
        self.ops
            .iter_mut()
            .find(|o| o.id() == id)
            .expect("operator id must be registered")
    }

    fn has_tensor(&self, id: TensorId) -> bool {
        self.tensors.iter().any(|t| t.fuid() == id)
    }

    fn has_op(&self, id: OpId) -> bool {
        self.ops.iter().any(|o| o.id() == id)
    }

    /// Creates a fresh tensor owned by this graph.
    pub fn add_tensor(&mut self, shape: impl Into<Shape>, dtype: DType) -> TensorId {
        let tensor = Tensor::new(shape.into(), dtype, self.runtime.clone());
        let id = tensor.fuid();
        self.tensors.push(tensor);
        id
    }

    /// Creates a fresh `f32` tensor, the default dtype of the core.
    pub fn add_tensor_default(&mut self, shape: impl Into<Shape>) -> TensorId {
        self.add_tensor(shape, DType::F32)
    }

    /// Imports an externally constructed tensor.
    ///
    /// The tensor must have been created against this graph's runtime, and
    /// its family id must not collide with a tensor already registered.
    pub fn import_tensor(&mut self, tensor: Tensor) -> Result<TensorId> {
        if !Arc::ptr_eq(tensor.runtime(), &self.runtime) {
            return Err(Error::invalid_graph(format!(
                "tensor runtime mismatch: cannot add a {} tensor to a {} graph",
                tensor.runtime().name(),
                self.runtime.name()
            )));
        }
        if self.has_tensor(tensor.fuid()) {
            return Err(Error::invalid_graph(format!(
                "tensor family id {} is already registered",
                tensor.fuid().0
            )));
        }
        let id = tensor.fuid();
        self.tensors.push(tensor);
        Ok(id)
    }

    /// Adds an operator, inferring shapes and dtypes and creating its output
    /// tensors in the graph.
    pub fn add_op(&mut self, kind: OpKind, inputs: impl Into<Vec<TensorId>>) -> Result<OpId> {
        self.add_op_impl(kind, inputs.into(), None)
    }

    /// Adds an operator with its output tensors specified. Declared output
    /// shapes and dtypes must agree with what inference derives.
    pub fn add_op_with_outputs(
        &mut self,
        kind: OpKind,
        inputs: impl Into<Vec<TensorId>>,
        outputs: impl Into<Vec<TensorId>>,
    ) -> Result<OpId> {
        self.add_op_impl(kind, inputs.into(), Some(outputs.into()))
    }

    fn add_op_impl(
        &mut self,
        mut kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Option<Vec<TensorId>>,
    ) -> Result<OpId> {
        if inputs.len() != kind.num_inputs() {
            return Err(Error::invalid_graph(format!(
                "{kind} expects {} inputs, got {}",
                kind.num_inputs(),
                inputs.len()
            )));
        }
        for id in &inputs {
            if !self.has_tensor(*id) {
                return Err(Error::invalid_graph(format!(
                    "input tensor {} is not registered in this graph",
                    id.0
                )));
            }
        }

        let input_shapes: Vec<Shape> = inputs
            .iter()
            .map(|id| self.tensor(*id).shape().clone())
            .collect();
        let input_dtypes: Vec<DType> = inputs.iter().map(|id| self.tensor(*id).dtype()).collect();
        let inferred_shapes = kind.infer_shape(&input_shapes)?;
        let inferred_dtypes = kind.infer_dtype(&input_dtypes);

        let outputs = match outputs {
            Some(declared) => {
                if declared.len() != kind.num_outputs() {
                    return Err(Error::invalid_graph(format!(
                        "{kind} expects {} outputs, got {}",
                        kind.num_outputs(),
                        declared.len()
                    )));
                }
                for ((id, shape), dtype) in declared
                    .iter()
                    .zip(&inferred_shapes)
                    .zip(&inferred_dtypes)
                {
                    let tensor = self.find_tensor(*id).ok_or_else(|| {
                        Error::invalid_graph(format!(
                            "output tensor {} is not registered in this graph",
                            id.0
                        ))
                    })?;
                    if tensor.shape() != shape {
                        return Err(Error::shape_mismatch(format!(
                            "declared output shape {} disagrees with inferred {shape}",
                            tensor.shape()
                        )));
                    }
                    if tensor.dtype() != *dtype {
                        return Err(Error::invalid_graph(format!(
                            "declared output dtype {} disagrees with inferred {dtype}",
                            tensor.dtype()
                        )));
                    }
                }
                declared
            }
            None => inferred_shapes
                .into_iter()
                .zip(inferred_dtypes)
                .map(|(shape, dtype)| self.add_tensor(shape, dtype))
                .collect(),
        };

        let op = Operator::new(kind, inputs, outputs);
        let id = op.id();
        self.connect(op);
        Ok(id)
    }

    /// Appends the operator and wires every edge it implies: input tensors
    /// gain it as a target, output tensors gain it as their source, and
    /// predecessor/successor pairs are exchanged with neighbouring operators.
    fn connect(&mut self, op: Operator) {
        self.sorted = false;
        let id = op.id();
        let inputs: Vec<TensorId> = op.inputs().to_vec();
        let outputs: Vec<TensorId> = op.outputs().to_vec();
        self.ops.push(op);

        for input in inputs {
            let source = {
                let tensor = self.tensor_mut(input);
                tensor.add_target(id);
                tensor.source()
            };
            if let Some(pred) = source {
                self.op_mut(pred).add_successor(id);
                self.op_mut(id).add_predecessor(pred);
            }
        }
        for output in outputs {
            let existing_targets: Vec<OpId> = {
                let tensor = self.tensor_mut(output);
                tensor.set_source(id);
                tensor.targets().to_vec()
            };
            for succ in existing_targets {
                self.op_mut(succ).add_predecessor(id);
                self.op_mut(id).add_successor(succ);
            }
        }
    }

    /// Runs the reverse of the insertion wiring for an operator that is about
    /// to be removed: target lists, sources, and predecessor/successor pairs
    /// all drop their references to it. The operator itself stays registered
    /// until [`Graph::remove_op`].
    pub fn disconnect_op(&mut self, id: OpId) {
        let (inputs, outputs, preds, succs) = {
            let op = self.op(id);
            (
                op.inputs().to_vec(),
                op.outputs().to_vec(),
                op.predecessors().to_vec(),
                op.successors().to_vec(),
            )
        };
        for input in inputs {
            self.tensor_mut(input).remove_target(id);
        }
        for output in outputs {
            self.tensor_mut(output).clear_source();
        }
        for pred in preds {
            if self.has_op(pred) {
                self.op_mut(pred).remove_successor(id);
            }
        }
        for succ in succs {
            if self.has_op(succ) {
                self.op_mut(succ).remove_predecessor(id);
            }
        }
    }

    /// Drops an operator from the op list. Callers are expected to have run
    /// [`Graph::disconnect_op`] first.
    pub fn remove_op(&mut self, id: OpId) {
        if let Some(index) = self.ops.iter().position(|o| o.id() == id) {
            self.ops.remove(index);
        }
    }

    /// Drops a tensor from the tensor list.
    pub fn remove_tensor(&mut self, id: TensorId) {
        if let Some(index) = self.tensors.iter().position(|t| t.fuid() == id) {
            self.tensors.remove(index);
        }
    }

    /// Rewrites every input slot of `op_id` reading `from` so it reads `to`
    /// instead, keeping both tensors' target lists and the derived
    /// predecessor/successor pairs in step.
    pub(crate) fn replace_op_input(&mut self, op_id: OpId, from: TensorId, to: TensorId) {
        let replaced = self.op_mut(op_id).replace_input_slots(from, to);
        if replaced == 0 {
            return;
        }
        self.tensor_mut(from).remove_target(op_id);
        for _ in 0..replaced {
            self.tensor_mut(to).add_target(op_id);
        }
        if let Some(old_pred) = self.tensor(from).source() {
            let still_reads = self
                .op(op_id)
                .inputs()
                .iter()
                .any(|input| self.tensor(*input).source() == Some(old_pred));
            if !still_reads {
                self.op_mut(old_pred).remove_successor(op_id);
                self.op_mut(op_id).remove_predecessor(old_pred);
            }
        }
        if let Some(pred) = self.tensor(to).source() {
            self.op_mut(pred).add_successor(op_id);
            self.op_mut(op_id).add_predecessor(pred);
        }
    }

    /// Graph inputs: tensors no operator produces.
    pub fn inputs(&self) -> Vec<TensorId> {
        self.tensors
            .iter()
            .filter(|t| t.source().is_none())
            .map(|t| t.fuid())
            .collect()
    }

    /// Graph outputs: tensors no operator consumes.
    pub fn outputs(&self) -> Vec<TensorId> {
        self.tensors
            .iter()
            .filter(|t| t.targets().is_empty())
            .map(|t| t.fuid())
            .collect()
    }

    /// Sorts the operator list topologically, returning false when the graph
    /// contains a cycle (the list is left untouched in that case).
    ///
    /// The sort is stable: independent operators keep their insertion order,
    /// which downstream passes may rely on.
    pub fn topo_sort(&mut self) -> bool {
        if self.sorted {
            return true;
        }
        let mut placed: HashSet<OpId> = HashSet::with_capacity(self.ops.len());
        let mut order: Vec<OpId> = Vec::with_capacity(self.ops.len());
        while order.len() < self.ops.len() {
            let mut modified = false;
            for op in &self.ops {
                if placed.contains(&op.id()) {
                    continue;
                }
                let ready = op.inputs().iter().all(|input| {
                    match self.tensor(*input).source() {
                        None => true,
                        Some(source) => placed.contains(&source),
                    }
                });
                if ready {
                    modified = true;
                    placed.insert(op.id());
                    order.push(op.id());
                }
            }
            if !modified {
                return false;
            }
        }

        let position: HashMap<OpId, usize> = order
            .iter()
            .enumerate()
            .map(|(index, id)| (*id, index))
            .collect();
        self.ops.sort_by_key(|op| position[&op.id()]);
        self.sorted = true;
        true
    }

    /// Recomputes output shapes for every operator in the current order and
    /// rewrites tensors whose shape changed.
    ///
    /// Assumes the operator list is topologically ordered; stale shapes
    /// upstream would otherwise feed downstream inference.
    pub fn shape_infer(&mut self) -> Result<()> {
        for index in 0..self.ops.len() {
            let (input_shapes, outputs) = {
                let op = &self.ops[index];
                let shapes: Vec<Shape> = op
                    .inputs()
                    .iter()
                    .map(|id| self.tensor(*id).shape().clone())
                    .collect();
                (shapes, op.outputs().to_vec())
            };
            let inferred = self.ops[index].kind_mut().infer_shape(&input_shapes)?;
            assert_eq!(
                inferred.len(),
                outputs.len(),
                "inference must produce one shape per output"
            );
            for (id, shape) in outputs.into_iter().zip(inferred) {
                if self.tensor(id).shape() != &shape {
                    self.tensor_mut(id).set_shape(shape);
                }
            }
        }
        Ok(())
    }

    /// Plans the whole memory footprint, materialises the arena, and binds a
    /// storage view to every tensor.
    ///
    /// Requires an acyclic graph. Tensors are allocated in insertion order
    /// and nothing is freed mid-plan, so the peak equals the sum of all
    /// tensor footprints; the allocator's free list exists so a
    /// liveness-aware planner can be dropped in without touching it.
    pub fn data_malloc(&mut self) -> Result<MemoryInfo> {
        if !self.topo_sort() {
            return Err(Error::CyclicGraph);
        }

        let footprints: Vec<usize> = self.tensors.iter().map(|t| t.bytes()).collect();
        let offsets: Vec<usize> = footprints
            .into_iter()
            .map(|bytes| self.allocator.alloc(bytes))
            .collect();

        let base = self.allocator.base()?;
        for (tensor, offset) in self.tensors.iter_mut().zip(offsets) {
            // Safety: the arena spans `peak` bytes and every offset was
            // handed out by the allocator, so `base + offset` stays in
            // bounds and non-null.
            let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
            tensor.bind_storage(StorageView::new(self.runtime.clone(), ptr));
        }
        Ok(self.allocator.info())
    }

    /// Diagnostic summary of the allocator's high-water marks.
    pub fn memory_info(&self) -> MemoryInfo {
        self.allocator.info()
    }

    /// Applies the local rewrites (transpose cancellation, transpose-into-
    /// matmul folding) to this graph.
    pub fn optimize(&mut self) {
        passes::fold_transposes(self);
    }

    /// Validates the closed set of graph invariants: no orphan tensors,
    /// every edge points at a registered entity, and family ids are unique.
    pub fn check_valid(&self) -> Result<()> {
        for tensor in &self.tensors {
            if tensor.source().is_none() && tensor.targets().is_empty() {
                return Err(Error::invalid_graph(format!(
                    "{tensor} has neither source nor targets"
                )));
            }
            for target in tensor.targets() {
                if !self.has_op(*target) {
                    return Err(Error::invalid_graph(format!(
                        "{tensor} targets unregistered operator {}",
                        target.0
                    )));
                }
            }
            if let Some(source) = tensor.source() {
                if !self.has_op(source) {
                    return Err(Error::invalid_graph(format!(
                        "{tensor} is sourced by unregistered operator {}",
                        source.0
                    )));
                }
            }
        }
        for op in &self.ops {
            for input in op.inputs() {
                if !self.has_tensor(*input) {
                    return Err(Error::invalid_graph(format!(
                        "operator {} reads unregistered tensor {}",
                        op.id().0,
                        input.0
                    )));
                }
            }
            for output in op.outputs() {
                if !self.has_tensor(*output) {
                    return Err(Error::invalid_graph(format!(
                        "operator {} writes unregistered tensor {}",
                        op.id().0,
                        output.0
                    )));
                }
            }
            for pred in op.predecessors() {
                if !self.has_op(*pred) {
                    return Err(Error::invalid_graph(format!(
                        "operator {} lists unregistered predecessor {}",
                        op.id().0,
                        pred.0
                    )));
                }
            }
            for succ in op.successors() {
                if !self.has_op(*succ) {
                    return Err(Error::invalid_graph(format!(
                        "operator {} lists unregistered successor {}",
                        op.id().0,
                        succ.0
                    )));
                }
            }
        }

        let mut seen = HashSet::with_capacity(self.tensors.len());
        for tensor in &self.tensors {
            if !seen.insert(tensor.fuid()) {
                return Err(Error::invalid_graph(format!(
                    "duplicate family id {}",
                    tensor.fuid().0
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph tensors:")?;
        for tensor in &self.tensors {
            writeln!(f, "  {tensor}")?;
        }
        writeln!(f, "Graph operators:")?;
        for op in &self.ops {
            let preds: Vec<u32> = op.predecessors().iter().map(|p| p.0).collect();
            let succs: Vec<u32> = op.successors().iter().map(|s| s.0).collect();
            writeln!(
                f,
                "  OP {}, pred {:?}, succ {:?}, {op}",
                op.id().0,
                preds,
                succs
            )?;
        }
        Ok(())
    }
}
