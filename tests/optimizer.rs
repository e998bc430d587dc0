use infer_rs::{CpuRuntime, Graph, OpKind, Shape};

#[test]
fn inverse_transpose_pair_is_cancelled() {
    let mut graph = Graph::new(CpuRuntime::new());
    let i1 = graph.add_tensor_default([1, 2, 3, 4]);
    let t1 = graph.add_tensor_default([1, 2, 4, 3]);
    let t2 = graph.add_tensor_default([1, 2, 3, 4]);
    let t3 = graph.add_tensor_default([1, 2, 3, 4]);

    graph
        .add_op_with_outputs(OpKind::transpose([0, 1, 3, 2]), vec![i1], vec![t1])
        .unwrap();
    graph
        .add_op_with_outputs(OpKind::transpose([0, 1, 3, 2]), vec![t1], vec![t2])
        .unwrap();
    let sink = graph
        .add_op_with_outputs(OpKind::Identity, vec![t2], vec![t3])
        .unwrap();

    graph.optimize();

    assert_eq!(graph.ops().len(), 1);
    assert_eq!(graph.ops()[0].id(), sink);
    assert_eq!(graph.op(sink).inputs(), &[i1]);
    assert!(graph.op(sink).predecessors().is_empty());
    assert_eq!(graph.tensor(i1).targets(), &[sink]);
    assert!(graph.find_tensor(t1).is_none());
    assert!(graph.find_tensor(t2).is_none());
    assert!(graph.check_valid().is_ok());
}

#[test]
fn equal_but_non_involutive_transposes_survive() {
    let mut graph = Graph::new(CpuRuntime::new());
    let input = graph.add_tensor_default([2, 3, 4]);
    // A 3-cycle permutation composed with itself is not the identity, so the
    // pair must not cancel.
    let first = graph
        .add_op(OpKind::transpose([1, 2, 0]), vec![input])
        .unwrap();
    let mid = graph.op(first).output();
    let second = graph
        .add_op(OpKind::transpose([1, 2, 0]), vec![mid])
        .unwrap();
    let out = graph.op(second).output();
    graph.add_op(OpKind::Identity, vec![out]).unwrap();

    graph.optimize();

    assert_eq!(graph.ops().len(), 3);
    assert!(graph.check_valid().is_ok());
}

#[test]
fn transpose_folds_into_matmul_on_the_b_side() {
    let mut graph = Graph::new(CpuRuntime::new());
    let a = graph.add_tensor_default([2, 3, 4]);
    let b = graph.add_tensor_default([2, 5, 4]);
    let bt = graph.add_tensor_default([2, 4, 5]);
    let c = graph.add_tensor_default([2, 3, 5]);

    graph
        .add_op_with_outputs(OpKind::transpose([0, 2, 1]), vec![b], vec![bt])
        .unwrap();
    let matmul = graph
        .add_op_with_outputs(OpKind::matmul(false, false), vec![a, bt], vec![c])
        .unwrap();

    graph.optimize();

    assert_eq!(graph.ops().len(), 1);
    match graph.op(matmul).kind() {
        OpKind::MatMul {
            trans_a, trans_b, ..
        } => {
            assert!(!*trans_a);
            assert!(*trans_b);
        }
        other => panic!("expected a matmul, found {other}"),
    }
    assert_eq!(graph.op(matmul).inputs(), &[a, b]);
    assert!(graph.find_tensor(bt).is_none());

    graph.shape_infer().unwrap();
    assert_eq!(graph.tensor(c).shape(), &Shape::from([2, 3, 5]));
    assert!(graph.check_valid().is_ok());
}

#[test]
fn transpose_folds_into_matmul_on_the_a_side() {
    let mut graph = Graph::new(CpuRuntime::new());
    let a = graph.add_tensor_default([4, 3]);
    let b = graph.add_tensor_default([4, 5]);

    let transpose = graph.add_op(OpKind::transpose([1, 0]), vec![a]).unwrap();
    let at = graph.op(transpose).output();
    let matmul = graph
        .add_op(OpKind::matmul(false, false), vec![at, b])
        .unwrap();
    let c = graph.op(matmul).output();
    assert_eq!(graph.tensor(c).shape(), &Shape::from([3, 5]));

    graph.optimize();

    assert_eq!(graph.ops().len(), 1);
    match graph.op(matmul).kind() {
        OpKind::MatMul {
            trans_a, trans_b, ..
        } => {
            assert!(*trans_a);
            assert!(!*trans_b);
        }
        other => panic!("expected a matmul, found {other}"),
    }
    assert_eq!(graph.op(matmul).inputs(), &[a, b]);

    graph.shape_infer().unwrap();
    assert_eq!(graph.tensor(c).shape(), &Shape::from([3, 5]));
    assert!(graph.check_valid().is_ok());
}

#[test]
fn folding_serves_every_matmul_consumer() {
    let mut graph = Graph::new(CpuRuntime::new());
    let a = graph.add_tensor_default([3, 4]);
    let b = graph.add_tensor_default([5, 4]);

    let transpose = graph.add_op(OpKind::transpose([1, 0]), vec![b]).unwrap();
    let bt = graph.op(transpose).output();
    let first = graph
        .add_op(OpKind::matmul(false, false), vec![a, bt])
        .unwrap();
    let second = graph
        .add_op(OpKind::matmul(false, false), vec![a, bt])
        .unwrap();

    graph.optimize();

    assert_eq!(graph.ops().len(), 2);
    for matmul in [first, second] {
        match graph.op(matmul).kind() {
            OpKind::MatMul { trans_b, .. } => assert!(*trans_b),
            other => panic!("expected a matmul, found {other}"),
        }
        assert_eq!(graph.op(matmul).inputs(), &[a, b]);
    }
    assert!(graph.find_tensor(bt).is_none());
    assert!(graph.check_valid().is_ok());
}

#[test]
fn transpose_with_a_non_matmul_reader_is_kept() {
    let mut graph = Graph::new(CpuRuntime::new());
    let a = graph.add_tensor_default([3, 4]);
    let b = graph.add_tensor_default([5, 4]);

    let transpose = graph.add_op(OpKind::transpose([1, 0]), vec![b]).unwrap();
    let bt = graph.op(transpose).output();
    let matmul = graph
        .add_op(OpKind::matmul(false, false), vec![a, bt])
        .unwrap();
    // A second, non-matmul reader keeps the transpose alive.
    let sink = graph.add_op(OpKind::Identity, vec![bt]).unwrap();

    graph.optimize();

    assert!(graph.find_tensor(bt).is_some());
    assert_eq!(graph.tensor(bt).targets(), &[sink]);
    assert_eq!(graph.op(matmul).inputs(), &[a, b]);
    assert_eq!(graph.ops().len(), 3);
    assert_eq!(graph.op(transpose).output(), bt);
    assert!(graph.op(matmul).predecessors().is_empty());
    assert_eq!(graph.op(transpose).successors(), &[sink]);
    assert!(graph.check_valid().is_ok());
}

#[test]
fn optimized_graph_still_plans_memory() {
    let mut graph = Graph::new(CpuRuntime::new());
    let a = graph.add_tensor_default([2, 3, 4]);
    let b = graph.add_tensor_default([2, 5, 4]);

    let transpose = graph.add_op(OpKind::transpose([0, 2, 1]), vec![b]).unwrap();
    let bt = graph.op(transpose).output();
    graph
        .add_op(OpKind::matmul(false, false), vec![a, bt])
        .unwrap();

    graph.optimize();
    graph.shape_infer().unwrap();
    let info = graph.data_malloc().unwrap();

    // a + b + c, all f32: (24 + 40 + 30) * 4 bytes.
    assert_eq!(info.peak, 376);
    assert!(graph.tensors().iter().all(|t| t.has_storage()));
}
