use std::collections::HashSet;

use crate::graph::{Graph, OpId, OpKind, TensorId};
use crate::tensor::shape::{compose_perms, is_identity_perm, is_swap_last_two, Axes};

/// Entities marked for deletion during a rewrite pass. Marking instead of
/// deleting in place keeps the operator list stable while it is scanned.
#[derive(Default)]
struct Marked {
    ops: HashSet<OpId>,
    tensors: HashSet<TensorId>,
}

/// One pass of transpose cancellation followed by one pass of
/// transpose-into-matmul folding, then a sweep that disconnects and drops
/// everything marked.
pub fn fold_transposes(graph: &mut Graph) {
    let mut marked = Marked::default();
    cancel_inverse_pairs(graph, &mut marked);
    fuse_into_matmul(graph, &mut marked);
    sweep(graph, marked);
}

fn transpose_perm(graph: &Graph, id: OpId) -> Option<Axes> {
    match graph.op(id).kind() {
        OpKind::Transpose { perm } => Some(perm.clone()),
        _ => None,
    }
}

/// Cancels `Transpose(p2)` applied to the result of `Transpose(p1)` whenever
/// the composition `p1`-then-`p2` is the identity: consumers of the second
/// transpose are rewired onto the first one's input and both operators (and
/// the tensors between them) are marked for deletion.
fn cancel_inverse_pairs(graph: &mut Graph, marked: &mut Marked) {
    let op_ids: Vec<OpId> = graph.ops().iter().map(|op| op.id()).collect();
    for id in op_ids {
        if marked.ops.contains(&id) {
            continue;
        }
        let Some(outer_perm) = transpose_perm(graph, id) else {
            continue;
        };
        let middle = graph.op(id).input(0);
        let Some(inner) = graph.tensor(middle).source() else {
            continue;
        };
        if marked.ops.contains(&inner) {
            continue;
        }
        let Some(inner_perm) = transpose_perm(graph, inner) else {
            continue;
        };
        let Some(composed) = compose_perms(&inner_perm, &outer_perm) else {
            continue;
        };
        if !is_identity_perm(&composed) {
            continue;
        }
        // The intermediate tensor goes away with the pair, so nothing else
        // may read it.
        let middle_targets = graph.tensor(middle).targets();
        if middle_targets.len() != 1 || middle_targets[0] != id {
            continue;
        }

        let original = graph.op(inner).input(0);
        let output = graph.op(id).output();
        let consumers: Vec<OpId> = graph.tensor(output).targets().to_vec();
        for consumer in consumers {
            graph.replace_op_input(consumer, output, original);
        }

        marked.tensors.insert(middle);
        marked.tensors.insert(output);
        marked.ops.insert(inner);
        marked.ops.insert(id);
    }
}

/// Folds a swap-last-two-axes transpose into every downstream matmul by
/// toggling the matching transpose flag and reading the transpose's own
/// input instead. The transpose is marked for deletion once its output has
/// no consumers left.
fn fuse_into_matmul(graph: &mut Graph, marked: &mut Marked) {
    let op_ids: Vec<OpId> = graph.ops().iter().map(|op| op.id()).collect();
    for id in op_ids {
        if marked.ops.contains(&id) {
            continue;
        }
        let Some(perm) = transpose_perm(graph, id) else {
            continue;
        };
        if !is_swap_last_two(&perm) {
            continue;
        }

        let output = graph.op(id).output();
        let replacement = graph.op(id).input(0);
        let consumers: Vec<OpId> = graph.tensor(output).targets().to_vec();
        for consumer in consumers {
            let (a_side, b_side) = match graph.op(consumer).kind() {
                OpKind::MatMul { .. } => {
                    let inputs = graph.op(consumer).inputs();
                    (inputs[0] == output, inputs[1] == output)
                }
                _ => continue,
            };
            if let OpKind::MatMul {
                trans_a, trans_b, ..
            } = graph.op_mut(consumer).kind_mut()
            {
                if a_side {
                    *trans_a = !*trans_a;
                }
                if b_side {
                    *trans_b = !*trans_b;
                }
            }
            graph.replace_op_input(consumer, output, replacement);
        }

        if graph.tensor(output).targets().is_empty() {
            marked.ops.insert(id);
            marked.tensors.insert(output);
        }
    }
}

fn sweep(graph: &mut Graph, marked: Marked) {
    for id in &marked.ops {
        graph.disconnect_op(*id);
    }
    for tensor in &marked.tensors {
        graph.remove_tensor(*tensor);
    }
    for id in &marked.ops {
        graph.remove_op(*id);
    }
}
