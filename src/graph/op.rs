//! Operator entity: a tagged sum of variants with per-variant shape inference.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::graph::TensorId;
use crate::tensor::shape::{validate_perm, Axes};
use crate::tensor::{DType, Shape};

/// Operator identity, unique across the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct OpId(pub u32);

static OP_COUNTER: AtomicU32 = AtomicU32::new(0);

fn next_op_id() -> OpId {
    OpId(OP_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Operator variants understood by the planning core.
///
/// Dispatch is by tag match; each variant carries its own attributes and a
/// plain shape-inference function below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    /// Reindexes the input axes by a permutation.
    Transpose { perm: Axes },
    /// Batched matrix multiply with transpose flags for either operand.
    /// `m`, `n`, `k` cache the problem dimensions of the last inference run.
    MatMul {
        trans_a: bool,
        trans_b: bool,
        m: usize,
        n: usize,
        k: usize,
    },
    /// Shape-preserving passthrough, useful as a graph sink.
    Identity,
}

impl OpKind {
    /// Convenience constructor for a matmul with unset cached dimensions.
    pub fn matmul(trans_a: bool, trans_b: bool) -> Self {
        OpKind::MatMul {
            trans_a,
            trans_b,
            m: 0,
            n: 0,
            k: 0,
        }
    }

    pub fn transpose(perm: impl IntoIterator<Item = usize>) -> Self {
        OpKind::Transpose {
            perm: perm.into_iter().collect(),
        }
    }

    /// Static input arity of the variant.
    pub fn num_inputs(&self) -> usize {
        match self {
            OpKind::Transpose { .. } | OpKind::Identity => 1,
            OpKind::MatMul { .. } => 2,
        }
    }

    /// Static output arity of the variant.
    pub fn num_outputs(&self) -> usize {
        1
    }

    /// Derives output shapes from input shapes and the variant's attributes.
    ///
    /// Pure with respect to the graph; a matmul additionally refreshes its
    /// cached `m`, `n`, `k` attributes.
    pub fn infer_shape(&mut self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        assert_eq!(
            inputs.len(),
            self.num_inputs(),
            "operator input arity mismatch"
        );
        match self {
            OpKind::Identity => Ok(vec![inputs[0].clone()]),
            OpKind::Transpose { perm } => {
                let input = &inputs[0];
                validate_perm(perm, input.rank())?;
                let dims = input.dims();
                Ok(vec![Shape::new(perm.iter().map(|&axis| dims[axis]))])
            }
            OpKind::MatMul {
                trans_a,
                trans_b,
                m,
                n,
                k,
            } => {
                let (a, b) = (&inputs[0], &inputs[1]);
                if a.rank() < 2 || b.rank() < 2 {
                    return Err(Error::shape_mismatch(format!(
                        "matmul operands must have rank >= 2, got {a} and {b}"
                    )));
                }
                let a_dims = a.dims();
                let b_dims = b.dims();
                let (rows, a_inner) = if *trans_a {
                    (a_dims[a.rank() - 1], a_dims[a.rank() - 2])
                } else {
                    (a_dims[a.rank() - 2], a_dims[a.rank() - 1])
                };
                let (b_inner, cols) = if *trans_b {
                    (b_dims[b.rank() - 1], b_dims[b.rank() - 2])
                } else {
                    (b_dims[b.rank() - 2], b_dims[b.rank() - 1])
                };
                if a_inner != b_inner {
                    return Err(Error::shape_mismatch(format!(
                        "matmul inner dimensions disagree: {a_inner} vs {b_inner} ({a} x {b})"
                    )));
                }

                let a_batch = Shape::from(&a_dims[..a.rank() - 2]);
                let b_batch = Shape::from(&b_dims[..b.rank() - 2]);
                let batch = Shape::broadcast(&a_batch, &b_batch)?;

                *m = rows;
                *n = cols;
                *k = a_inner;

                let mut out: Axes = batch.dims().iter().copied().collect();
                out.push(rows);
                out.push(cols);
                Ok(vec![Shape::new(out)])
            }
        }
    }

    /// Derives output dtypes. Every current variant propagates the first
    /// input's dtype.
    pub fn infer_dtype(&self, inputs: &[DType]) -> Vec<DType> {
        assert_eq!(
            inputs.len(),
            self.num_inputs(),
            "operator input arity mismatch"
        );
        vec![inputs[0]; self.num_outputs()]
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Identity => write!(f, "Identity"),
            OpKind::Transpose { perm } => write!(f, "Transpose(perm={perm:?})"),
            OpKind::MatMul {
                trans_a,
                trans_b,
                m,
                n,
                k,
            } => write!(
                f,
                "Matmul([{},{}], mnk=[{m},{n},{k}])",
                if *trans_a { "A^T" } else { "A" },
                if *trans_b { "B^T" } else { "B" },
            ),
        }
    }
}

/// An operator instance inside a graph, with owning references to its tensors
/// and derived back-references to neighbouring operators.
pub struct Operator {
    id: OpId,
    kind: OpKind,
    inputs: SmallVec<[TensorId; 2]>,
    outputs: SmallVec<[TensorId; 2]>,
    predecessors: SmallVec<[OpId; 4]>,
    successors: SmallVec<[OpId; 4]>,
}

impl Operator {
    pub(crate) fn new(
        kind: OpKind,
        inputs: impl IntoIterator<Item = TensorId>,
        outputs: impl IntoIterator<Item = TensorId>,
    ) -> Self {
        Operator {
            id: next_op_id(),
            kind,
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
            predecessors: SmallVec::new(),
            successors: SmallVec::new(),
        }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut OpKind {
        &mut self.kind
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// The i-th input tensor. Panics when `index` is out of range.
    pub fn input(&self, index: usize) -> TensorId {
        self.inputs[index]
    }

    /// The single output tensor. Panics for multi-output variants.
    pub fn output(&self) -> TensorId {
        assert_eq!(self.outputs.len(), 1, "operator has multiple outputs");
        self.outputs[0]
    }

    /// Producing operators of this operator's inputs, derived from tensor
    /// edges. May contain duplicates when several inputs share a producer.
    pub fn predecessors(&self) -> &[OpId] {
        &self.predecessors
    }

    /// Consuming operators of this operator's outputs, derived from tensor
    /// edges.
    pub fn successors(&self) -> &[OpId] {
        &self.successors
    }

    /// Produces a detached copy bound to the given tensors: attributes are
    /// kept, back-edges are cleared. Back-edges belong to a graph context,
    /// not to the operator's identity.
    pub fn clone_with(
        &self,
        new_inputs: impl IntoIterator<Item = TensorId>,
        new_outputs: impl IntoIterator<Item = TensorId>,
    ) -> Operator {
        Operator::new(self.kind.clone(), new_inputs, new_outputs)
    }

    pub(crate) fn replace_input_slots(&mut self, from: TensorId, to: TensorId) -> usize {
        let mut replaced = 0;
        for slot in self.inputs.iter_mut() {
            if *slot == from {
                *slot = to;
                replaced += 1;
            }
        }
        replaced
    }

    pub(crate) fn add_predecessor(&mut self, op: OpId) {
        self.predecessors.push(op);
    }

    pub(crate) fn add_successor(&mut self, op: OpId) {
        self.successors.push(op);
    }

    pub(crate) fn remove_predecessor(&mut self, op: OpId) {
        self.predecessors.retain(|id| *id != op);
    }

    pub(crate) fn remove_successor(&mut self, op: OpId) {
        self.successors.retain(|id| *id != op);
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(in={:?}, out={:?})",
            self.kind,
            self.inputs.iter().map(|t| t.0).collect::<Vec<_>>(),
            self.outputs.iter().map(|t| t.0).collect::<Vec<_>>(),
        )
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("predecessors", &self.predecessors)
            .field("successors", &self.successors)
            .finish()
    }
}
