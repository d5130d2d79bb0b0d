//! Peephole optimizer: a single linear sweep over the operator list that
//! applies two local rewrites.
//!
//! Grounded on `original_source/src/core/graph.cc`'s `optimize()`, with two
//! deliberate tightenings beyond what that function literally checks (see
//! `DESIGN.md`): Rule 1 verifies the two transposes' permutations are
//! actual inverses of each other rather than assuming any adjacent
//! transpose pair cancels, and Rule 2 requires the absorbed transpose to
//! swap only the last two axes rather than assuming any transpose is
//! absorbable. Both gaps would silently produce a wrong graph on inputs
//! the distilled spec's property list (§8) exercises.

use crate::graph::Graph;
use crate::ids::Guid;
use crate::op::{perms_cancel, OpKind};
use crate::tensor::Tensor;

/// Run the optimizer: one pass over the operators present when the call
/// began, attempting Rule 1 on every `Transpose` and Rule 2 on every
/// `MatMul`. A rewrite that doesn't apply is skipped, never aborts the
/// sweep.
pub(crate) fn run(graph: &mut Graph) {
  let guids: Vec<Guid> = graph.operators().iter().map(|op| op.guid()).collect();
  for guid in guids {
    let Some(op) = graph.get_operator(guid) else {
      // already spliced out by an earlier rewrite in this same sweep
      continue;
    };
    match op.kind() {
      OpKind::Transpose { .. } => {
        try_cancel_transpose_pair(graph, guid);
      }
      OpKind::MatMul { .. } => {
        try_fuse_transpose_into_matmul(graph, guid);
      }
    }
  }
}

/// Rule 1: `Transpose(Transpose(x, p1), p2)` with `p1`/`p2` exact inverses
/// and the intermediate tensor read by nothing else collapses to `x`
/// itself, eliminating both transposes and the tensor between them.
fn try_cancel_transpose_pair(graph: &mut Graph, guid: Guid) -> bool {
  let op = graph.get_operator(guid).unwrap();
  let OpKind::Transpose { perm: p1 } = op.kind().clone() else {
    return false;
  };
  let input = op.inputs()[0];
  let output = op.outputs()[0];

  if graph.get_tensor(input).unwrap().targets().len() != 1 {
    return false;
  }
  let out_targets = graph.get_tensor(output).unwrap().targets().to_vec();
  let &[next_guid] = out_targets.as_slice() else {
    return false;
  };
  let next_op = graph.get_operator(next_guid).unwrap();
  let OpKind::Transpose { perm: p2 } = next_op.kind().clone() else {
    return false;
  };
  if next_op.inputs().first().copied() != Some(output) {
    return false;
  }
  if !perms_cancel(&p1, &p2) {
    return false;
  }
  let next_output = next_op.outputs()[0];

  graph.get_tensor_mut(input).unwrap().remove_target(guid);
  graph.get_tensor_mut(output).unwrap().set_source(None);
  graph.get_tensor_mut(output).unwrap().remove_target(next_guid);
  graph.get_tensor_mut(next_output).unwrap().set_source(None);

  let op_preds = graph.get_operator(guid).unwrap().predecessors().to_vec();
  let op_succs = graph.get_operator(guid).unwrap().successors().to_vec();
  for p in &op_preds {
    graph.get_operator_mut(*p).unwrap().remove_successor(guid);
  }
  for s in &op_succs {
    graph.get_operator_mut(*s).unwrap().remove_predecessor(guid);
  }

  let next_preds = graph.get_operator(next_guid).unwrap().predecessors().to_vec();
  for p in &next_preds {
    graph.get_operator_mut(*p).unwrap().remove_successor(next_guid);
  }
  let next_succs = graph.get_operator(next_guid).unwrap().successors().to_vec();

  let input_source = graph.get_tensor(input).unwrap().source();

  for succ in &next_succs {
    graph.get_operator_mut(*succ).unwrap().remove_predecessor(next_guid);
    graph.get_operator_mut(*succ).unwrap().replace_input(next_output, input);
    graph.get_tensor_mut(input).unwrap().add_target(*succ);
    if let Some(src) = input_source {
      graph.get_operator_mut(src).unwrap().add_successor(*succ);
      graph.get_operator_mut(*succ).unwrap().add_predecessor(src);
    }
  }

  graph.remove_operator(guid);
  graph.remove_operator(next_guid);
  graph.remove_tensor(output);
  graph.remove_tensor(next_output);
  graph.invalidate_sorted();
  true
}

/// Rule 2: a `MatMul` reading the output of a last-two-axes `Transpose`
/// absorbs that transpose into its own `trans_a`/`trans_b` flag, removing
/// the transpose operator and its output tensor. Checks both operands;
/// a single `MatMul` can absorb a transpose on each side in the same visit.
fn try_fuse_transpose_into_matmul(graph: &mut Graph, guid: Guid) -> bool {
  let op = graph.get_operator(guid).unwrap();
  let (mut trans_a, mut trans_b) = match op.kind() {
    OpKind::MatMul { trans_a, trans_b } => (*trans_a, *trans_b),
    _ => return false,
  };
  let inputs = op.inputs().to_vec();
  if inputs.len() != 2 {
    return false;
  }

  let mut fused = false;
  for (slot, &input) in inputs.iter().enumerate() {
    let Some(src_guid) = graph.get_tensor(input).and_then(Tensor::source) else {
      continue;
    };
    let Some(src_op) = graph.get_operator(src_guid) else {
      continue;
    };
    if !src_op.is_last_two_axes_swap() {
      continue;
    }
    let transpose_input = src_op.inputs()[0];

    graph.get_tensor_mut(input).unwrap().remove_target(guid);
    graph.get_tensor_mut(input).unwrap().set_source(None);
    graph.get_tensor_mut(transpose_input).unwrap().remove_target(src_guid);

    let preds = graph.get_operator(src_guid).unwrap().predecessors().to_vec();
    let succs = graph.get_operator(src_guid).unwrap().successors().to_vec();
    for p in &preds {
      graph.get_operator_mut(*p).unwrap().remove_successor(src_guid);
    }
    for s in &succs {
      graph.get_operator_mut(*s).unwrap().remove_predecessor(src_guid);
    }

    graph.get_operator_mut(guid).unwrap().replace_input(input, transpose_input);
    graph.get_tensor_mut(transpose_input).unwrap().add_target(guid);
    if let Some(new_src) = graph.get_tensor(transpose_input).unwrap().source() {
      graph.get_operator_mut(new_src).unwrap().add_successor(guid);
      graph.get_operator_mut(guid).unwrap().add_predecessor(new_src);
    }

    graph.remove_operator(src_guid);
    graph.remove_tensor(input);

    if slot == 0 {
      trans_a = true;
    } else {
      trans_b = true;
    }
    fused = true;
  }

  if fused {
    graph.get_operator_mut(guid).unwrap().replace_kind(OpKind::MatMul { trans_a, trans_b });
    graph.invalidate_sorted();
  }
  fused
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::runtime::SystemRuntime;
  use crate::tensor::DType;
  use std::sync::Arc;

  fn rt() -> Arc<dyn crate::runtime::Runtime> {
    Arc::new(SystemRuntime::new())
  }

  #[test]
  fn s3_inverse_transpose_pair_cancels() {
    let mut g = Graph::new(rt());
    let a = g.add_tensor(vec![2, 3, 4], DType::F32);
    let b = g.add_tensor(vec![2, 4, 3], DType::F32);
    let c = g.add_tensor(vec![2, 3, 4], DType::F32);
    g.add_operator_and_connect(OpKind::Transpose { perm: vec![0, 2, 1] }, vec![a], vec![b]);
    g.add_operator_and_connect(OpKind::Transpose { perm: vec![0, 2, 1] }, vec![b], vec![c]);
    g.optimize();
    assert!(g.operators().is_empty());
    assert!(g.get_tensor(b).is_none());
    assert!(g.get_tensor(c).is_none());
    assert!(g.get_tensor(a).unwrap().targets().is_empty());
  }

  #[test]
  fn s3_is_skipped_when_the_intermediate_has_another_reader() {
    let mut g = Graph::new(rt());
    let a = g.add_tensor(vec![2, 3], DType::F32);
    let b = g.add_tensor(vec![3, 2], DType::F32);
    let c = g.add_tensor(vec![2, 3], DType::F32);
    let d = g.add_tensor(vec![2, 3], DType::F32);
    g.add_operator_and_connect(OpKind::Transpose { perm: vec![1, 0] }, vec![a], vec![b]);
    g.add_operator_and_connect(OpKind::Transpose { perm: vec![1, 0] }, vec![b], vec![c]);
    // A second reader of `a` is irrelevant to whether *this* pair cancels;
    // what blocks Rule 1 is a second reader of the tensor *between* the two
    // transposes. Model that instead: add a second consumer of `b`.
    g.add_operator_and_connect(OpKind::Transpose { perm: vec![1, 0] }, vec![b], vec![d]);
    g.optimize();
    // the pair can no longer cancel because b has two targets
    assert_eq!(g.operators().len(), 3);
  }

  #[test]
  fn s4_transpose_folds_into_matmul_trans_b() {
    let mut g = Graph::new(rt());
    let a = g.add_tensor(vec![2, 3], DType::F32);
    let b = g.add_tensor(vec![4, 3], DType::F32);
    let bt = g.add_tensor(vec![3, 4], DType::F32);
    let c = g.add_tensor(vec![2, 4], DType::F32);
    g.add_operator_and_connect(OpKind::Transpose { perm: vec![1, 0] }, vec![b], vec![bt]);
    let matmul = g.add_operator_and_connect(OpKind::MatMul { trans_a: false, trans_b: false }, vec![a, bt], vec![c]);
    g.optimize();
    assert_eq!(g.operators().len(), 1);
    let op = g.get_operator(matmul).unwrap();
    assert_eq!(op.kind(), &OpKind::MatMul { trans_a: false, trans_b: true });
    assert_eq!(op.inputs(), &[a, b]);
    assert!(g.get_tensor(bt).is_none());
  }

  #[test]
  fn s5_non_last_two_axes_transpose_is_not_fused() {
    let mut g = Graph::new(rt());
    let a = g.add_tensor(vec![2, 3, 4], DType::F32);
    let b = g.add_tensor(vec![5, 3, 4], DType::F32);
    let bt = g.add_tensor(vec![3, 5, 4], DType::F32);
    let c = g.add_tensor(vec![2, 3, 5, 3, 4], DType::F32);
    // swaps axes 0 and 1, not the last two -- must not fold into trans_b
    g.add_operator_and_connect(OpKind::Transpose { perm: vec![1, 0, 2] }, vec![b], vec![bt]);
    let matmul = g.add_operator_and_connect(OpKind::MatMul { trans_a: false, trans_b: false }, vec![a, bt], vec![c]);
    g.optimize();
    assert_eq!(g.operators().len(), 2);
    let op = g.get_operator(matmul).unwrap();
    assert_eq!(op.kind(), &OpKind::MatMul { trans_a: false, trans_b: false });
  }

  #[test]
  fn s6_full_pipeline_optimizes_then_plans_storage() {
    let mut g = Graph::new(rt());
    let a = g.add_tensor(vec![2, 3], DType::F32);
    let b = g.add_tensor(vec![4, 3], DType::F32);
    let bt = g.add_tensor(vec![3, 4], DType::F32);
    let c = g.add_tensor(vec![1, 1], DType::F32);
    g.add_operator_and_connect(OpKind::Transpose { perm: vec![1, 0] }, vec![b], vec![bt]);
    g.add_operator_and_connect(OpKind::MatMul { trans_a: false, trans_b: false }, vec![a, bt], vec![c]);

    g.optimize();
    assert!(g.topo_sort());
    g.shape_infer().unwrap();
    assert_eq!(g.get_tensor(c).unwrap().shape(), &[2, 4]);

    g.data_malloc().unwrap();
    assert!(g.check_valid());
    for tensor in g.tensors() {
      assert!(tensor.data_blob().is_some());
    }
  }

  #[test]
  fn fuses_both_operands_in_one_visit() {
    let mut g = Graph::new(rt());
    let a = g.add_tensor(vec![3, 2], DType::F32);
    let at = g.add_tensor(vec![2, 3], DType::F32);
    let b = g.add_tensor(vec![4, 3], DType::F32);
    let bt = g.add_tensor(vec![3, 4], DType::F32);
    let c = g.add_tensor(vec![2, 4], DType::F32);
    g.add_operator_and_connect(OpKind::Transpose { perm: vec![1, 0] }, vec![a], vec![at]);
    g.add_operator_and_connect(OpKind::Transpose { perm: vec![1, 0] }, vec![b], vec![bt]);
    let matmul = g.add_operator_and_connect(OpKind::MatMul { trans_a: false, trans_b: false }, vec![at, bt], vec![c]);
    g.optimize();
    let op = g.get_operator(matmul).unwrap();
    assert_eq!(op.kind(), &OpKind::MatMul { trans_a: true, trans_b: true });
    assert_eq!(op.inputs(), &[a, b]);
  }
}
