use infer_rs::{CpuRuntime, DType, Graph, OpKind};

#[test]
fn every_tensor_gets_a_view_into_one_arena() {
    let mut graph = Graph::new(CpuRuntime::new());
    let a = graph.add_tensor_default([2, 3, 4]);
    let b = graph.add_tensor_default([2, 4, 5]);
    let matmul = graph
        .add_op(OpKind::matmul(false, false), vec![a, b])
        .unwrap();
    let c = graph.op(matmul).output();

    graph.shape_infer().unwrap();
    let info = graph.data_malloc().unwrap();

    // Nothing is freed during planning, so the peak is the sum of all
    // tensor footprints: (24 + 40 + 30) * 4 bytes, each 8-byte aligned.
    assert_eq!(info.peak, 376);
    assert_eq!(info.used, info.peak);

    let base = graph
        .tensors()
        .iter()
        .map(|t| t.raw_ptr() as usize)
        .min()
        .unwrap();
    for tensor in graph.tensors() {
        assert!(tensor.has_storage());
        let offset = tensor.raw_ptr() as usize - base;
        assert_eq!(offset % 8, 0);
        assert!(offset + tensor.bytes() <= info.peak);
    }

    assert_eq!(graph.tensor(c).shape().dims(), &[2, 3, 5]);
}

#[test]
fn planning_accounts_for_dtype_widths() {
    let mut graph = Graph::new(CpuRuntime::new());
    let input = graph.add_tensor([8, 8], DType::F16);
    let op = graph
        .add_op(OpKind::transpose([1, 0]), vec![input])
        .unwrap();
    let output = graph.op(op).output();
    assert_eq!(graph.tensor(output).dtype(), DType::F16);

    let info = graph.data_malloc().unwrap();
    // Two 64-element f16 tensors, 128 bytes each.
    assert_eq!(info.peak, 256);
}

#[test]
fn planning_a_sorted_graph_leaves_order_intact() {
    let mut graph = Graph::new(CpuRuntime::new());
    let input = graph.add_tensor_default([4, 4]);
    let first = graph.add_op(OpKind::Identity, vec![input]).unwrap();
    let mid = graph.op(first).output();
    let second = graph.add_op(OpKind::Identity, vec![mid]).unwrap();

    graph.data_malloc().unwrap();
    let order: Vec<_> = graph.ops().iter().map(|op| op.id()).collect();
    assert_eq!(order, vec![first, second]);
}
