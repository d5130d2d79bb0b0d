//! Operators: the nodes that consume and produce tensors.
//!
//! Kept as a tagged enum (`OpKind`) rather than trait-object polymorphism.
//! The distilled spec calls this out explicitly (§9 design notes): with only
//! two operator kinds and closed-world shape inference, a `dyn Operator`
//! trait buys dynamic dispatch the graph never needs and costs an indirection
//! on every `shape_infer`/`optimize` pass.

use crate::ids::{Fuid, Guid};

/// The operation an [`Operator`] performs, and the parameters that affect
/// its shape inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
  /// Batched matrix multiply. `trans_a`/`trans_b` request an implicit
  /// transpose of the last two axes of the corresponding input before the
  /// multiply, without materializing a separate transposed tensor.
  MatMul {
    /// Read the first operand transposed on its last two axes.
    trans_a: bool,
    /// Read the second operand transposed on its last two axes.
    trans_b: bool,
  },
  /// Permute axes according to `perm`, a permutation of `0..rank`.
  Transpose {
    /// `perm[i]` is the source axis that becomes axis `i` of the output.
    perm: Vec<usize>,
  },
}

impl OpKind {
  fn name(&self) -> &'static str {
    match self {
      OpKind::MatMul { .. } => "Matmul",
      OpKind::Transpose { .. } => "Transpose",
    }
  }
}

/// A node in the computation graph that reads zero-or-more input tensors
/// and writes one-or-more output tensors.
///
/// Identified by a monotonically assigned [`Guid`]. `inputs`/`outputs` are
/// ordered by the order they were connected in (matching the distilled
/// spec's `addOperatorAndConnect`), not resorted by `Fuid`. `predecessors`/
/// `successors` are caches maintained by [`crate::graph::Graph`], derived
/// from which operators currently produce/consume this operator's
/// inputs/outputs — never touched directly by operator logic itself.
#[derive(Debug, Clone)]
pub struct Operator {
  guid: Guid,
  kind: OpKind,
  inputs: Vec<Fuid>,
  outputs: Vec<Fuid>,
  predecessors: Vec<Guid>,
  successors: Vec<Guid>,
}

impl Operator {
  pub(crate) fn new(kind: OpKind, inputs: Vec<Fuid>, outputs: Vec<Fuid>) -> Self {
    Self {
      guid: Guid::alloc(),
      kind,
      inputs,
      outputs,
      predecessors: Vec::new(),
      successors: Vec::new(),
    }
  }

  /// This operator's unique identifier.
  #[inline]
  pub fn guid(&self) -> Guid {
    self.guid
  }

  /// The operation this node performs.
  #[inline]
  pub fn kind(&self) -> &OpKind {
    &self.kind
  }

  /// Input tensors, in connection order.
  #[inline]
  pub fn inputs(&self) -> &[Fuid] {
    &self.inputs
  }

  /// Output tensors, in connection order.
  #[inline]
  pub fn outputs(&self) -> &[Fuid] {
    &self.outputs
  }

  /// Operators that produce at least one of this operator's inputs.
  #[inline]
  pub fn predecessors(&self) -> &[Guid] {
    &self.predecessors
  }

  /// Operators that consume at least one of this operator's outputs.
  #[inline]
  pub fn successors(&self) -> &[Guid] {
    &self.successors
  }

  pub(crate) fn replace_kind(&mut self, kind: OpKind) {
    self.kind = kind;
  }

  /// Replace every occurrence of `old` in `inputs` with `new`, preserving
  /// position. Used by the optimizer when splicing operators out of the
  /// graph.
  pub(crate) fn replace_input(&mut self, old: Fuid, new: Fuid) {
    for slot in self.inputs.iter_mut() {
      if *slot == old {
        *slot = new;
      }
    }
  }

  pub(crate) fn add_predecessor(&mut self, guid: Guid) {
    if !self.predecessors.contains(&guid) {
      self.predecessors.push(guid);
    }
  }

  pub(crate) fn add_successor(&mut self, guid: Guid) {
    if !self.successors.contains(&guid) {
      self.successors.push(guid);
    }
  }

  pub(crate) fn remove_predecessor(&mut self, guid: Guid) {
    self.predecessors.retain(|&g| g != guid);
  }

  pub(crate) fn remove_successor(&mut self, guid: Guid) {
    self.successors.retain(|&g| g != guid);
  }

  /// Infer this operator's output shape(s) from `input_shapes`, given in
  /// the same order as `self.inputs()`. Returns `None` on a shape mismatch
  /// (batch-prefix mismatch for `MatMul`, wrong-length `perm` for
  /// `Transpose`) — the driver surfaces that as a structural assertion, per
  /// `SPEC_FULL.md` §7, since a well-formed graph should never disagree
  /// with its own operators about shapes.
  pub fn infer_shape(&self, input_shapes: &[&[usize]]) -> Option<Vec<usize>> {
    match &self.kind {
      OpKind::MatMul { trans_a, trans_b } => {
        let [a, b] = input_shapes else { return None };
        infer_matmul_shape(a, *trans_a, b, *trans_b)
      }
      OpKind::Transpose { perm } => {
        let [shape] = input_shapes else { return None };
        infer_transpose_shape(shape, perm)
      }
    }
  }

  /// `true` if this is a `Transpose` that swaps only the last two axes
  /// (the only transpose shape `MatMul` can absorb via `trans_a`/`trans_b`).
  pub fn is_last_two_axes_swap(&self) -> bool {
    match &self.kind {
      OpKind::Transpose { perm } => is_last_two_axes_swap_perm(perm),
      OpKind::MatMul { .. } => false,
    }
  }

  /// Render this operator's stable text form, resolving the `mnk=[m,n,k]`
  /// suffix a `MatMul` line carries via `shape_of` — `Operator` itself only
  /// knows its inputs' `Fuid`s, not their shapes, so the graph-level caller
  /// supplies a shape lookup. Any other operator kind renders identically to
  /// its plain [`Display`] form.
  pub fn render_with_shapes(&self, shape_of: impl Fn(Fuid) -> Option<Vec<usize>>) -> String {
    let OpKind::MatMul { trans_a, trans_b } = &self.kind else {
      return self.to_string();
    };
    let mnk = self.inputs.first().zip(self.inputs.get(1)).and_then(|(&a, &b)| {
      let a_shape = shape_of(a)?;
      let b_shape = shape_of(b)?;
      if a_shape.len() < 2 || b_shape.len() < 2 {
        return None;
      }
      let (m, k_a) = effective_last_two(&a_shape, *trans_a);
      let (k_b, n) = effective_last_two(&b_shape, *trans_b);
      if k_a != k_b {
        return None;
      }
      Some((m, n, k_a))
    });
    let a = self.inputs.first().copied();
    let b = self.inputs.get(1).copied();
    let c = self.outputs.first().copied();
    let mnk_str = match mnk {
      Some((m, n, k)) => format!("mnk=[{m},{n},{k}]"),
      None => "mnk=[?,?,?]".to_string(),
    };
    format!(
      "{}([{},{}],A={},B={},C={},{})",
      self.kind.name(),
      if *trans_a { "A^T" } else { "A" },
      if *trans_b { "B^T" } else { "B" },
      a.map(|x| x.get()).unwrap_or_default(),
      b.map(|x| x.get()).unwrap_or_default(),
      c.map(|x| x.get()).unwrap_or_default(),
      mnk_str,
    )
  }
}

impl std::fmt::Display for Operator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.kind {
      OpKind::MatMul { trans_a, trans_b } => {
        let a = self.inputs.first().copied();
        let b = self.inputs.get(1).copied();
        let c = self.outputs.first().copied();
        write!(
          f,
          "{}([{},{}],A={},B={},C={})",
          self.kind.name(),
          if *trans_a { "A^T" } else { "A" },
          if *trans_b { "B^T" } else { "B" },
          a.map(|x| x.get()).unwrap_or_default(),
          b.map(|x| x.get()).unwrap_or_default(),
          c.map(|x| x.get()).unwrap_or_default(),
        )
      }
      OpKind::Transpose { perm } => {
        let inp = self.inputs.first().copied();
        let out = self.outputs.first().copied();
        write!(
          f,
          "{}(perm={:?},input={},output={})",
          self.kind.name(),
          perm,
          inp.map(|x| x.get()).unwrap_or_default(),
          out.map(|x| x.get()).unwrap_or_default(),
        )
      }
    }
  }
}

/// Swap the last two axes per `trans_a`/`trans_b`, then prepend the common
/// batch prefix to `[m, n]` where `m` is `a`'s second-to-last axis (after
/// any transpose) and `n` is `b`'s last axis (after any transpose).
fn infer_matmul_shape(a: &[usize], trans_a: bool, b: &[usize], trans_b: bool) -> Option<Vec<usize>> {
  if a.len() < 2 || b.len() < 2 {
    return None;
  }
  let a_eff = effective_last_two(a, trans_a);
  let b_eff = effective_last_two(b, trans_b);
  let (m, k_a) = a_eff;
  let (k_b, n) = b_eff;
  if k_a != k_b {
    return None;
  }
  let a_batch = &a[..a.len() - 2];
  let b_batch = &b[..b.len() - 2];
  if a_batch != b_batch {
    return None;
  }
  let mut out = a_batch.to_vec();
  out.push(m);
  out.push(n);
  Some(out)
}

/// The `(rows, cols)` of the last two axes of `shape` after an implicit
/// transpose, without touching the underlying `Vec`.
fn effective_last_two(shape: &[usize], transposed: bool) -> (usize, usize) {
  let n = shape.len();
  let (r, c) = (shape[n - 2], shape[n - 1]);
  if transposed {
    (c, r)
  } else {
    (r, c)
  }
}

fn infer_transpose_shape(shape: &[usize], perm: &[usize]) -> Option<Vec<usize>> {
  if perm.len() != shape.len() {
    return None;
  }
  let mut seen = vec![false; perm.len()];
  let mut out = Vec::with_capacity(shape.len());
  for &axis in perm {
    if axis >= shape.len() || seen[axis] {
      return None;
    }
    seen[axis] = true;
    out.push(shape[axis]);
  }
  Some(out)
}

fn is_last_two_axes_swap_perm(perm: &[usize]) -> bool {
  let n = perm.len();
  if n < 2 {
    return false;
  }
  perm[..n - 2].iter().enumerate().all(|(i, &p)| p == i)
    && perm[n - 2] == n - 1
    && perm[n - 1] == n - 2
}

/// `true` if composing `first` then `second` (i.e. `second[first[i]]` for
/// every axis `i`, reading the two permutations as functions applied in
/// sequence) yields the identity permutation — the condition under which a
/// transpose-then-transpose pair cancels out exactly.
pub fn perms_cancel(first: &[usize], second: &[usize]) -> bool {
  if first.len() != second.len() {
    return false;
  }
  first
    .iter()
    .enumerate()
    .all(|(i, &p)| second.get(p).copied() == Some(i))
}
