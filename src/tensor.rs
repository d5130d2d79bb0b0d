//! Tensors: shape, element type, data binding, and producer/consumer
//! linkage. Owned exclusively by a [`crate::graph::Graph`]; mutated only
//! through `Graph`-mediated calls (`addTarget`/`removeTarget`/`setSource`/
//! `setDataBlob`/`setShape` in the distilled spec's vocabulary).

use std::sync::Arc;

use crate::ids::{Fuid, Guid};
use crate::runtime::Runtime;

/// Element type of a tensor.
///
/// Covers at least one integer and one floating width at 1/2/4/8 bytes,
/// per `SPEC_FULL.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
  /// 8-bit signed integer.
  I8,
  /// 16-bit signed integer.
  I16,
  /// 32-bit signed integer.
  I32,
  /// 64-bit signed integer.
  I64,
  /// 8-bit IEEE-754-ish minifloat (E4M3-style storage width only; this
  /// crate does not interpret the bit pattern, only its byte size).
  F8,
  /// IEEE-754 half precision float.
  F16,
  /// IEEE-754 single precision float.
  F32,
  /// IEEE-754 double precision float.
  F64,
}

impl DType {
  /// Size in bytes of one element of this type.
  pub fn size(self) -> usize {
    match self {
      DType::I8 | DType::F8 => 1,
      DType::I16 | DType::F16 => 2,
      DType::I32 | DType::F32 => 4,
      DType::I64 | DType::F64 => 8,
    }
  }
}

/// A resolved binding of a tensor's data to a location in the arena.
///
/// Set exactly once by [`crate::graph::Graph::data_malloc`].
#[derive(Debug, Clone, Copy)]
pub struct DataBlob {
  /// Byte offset into the arena, as planned by the allocator.
  pub offset: usize,
  /// Resolved pointer: `arena_base + offset`.
  pub ptr: *mut u8,
}

/// A tensor node in the computation graph.
///
/// Identified by a monotonically assigned [`Fuid`]. Has at most one
/// source operator (the producer) and any number of target operators
/// (consumers); a tensor with neither is illegal (`SPEC_FULL.md` §3,
/// enforced by [`crate::graph::Graph::check_valid`]).
#[derive(Debug, Clone)]
pub struct Tensor {
  fuid: Fuid,
  shape: Vec<usize>,
  dtype: DType,
  source: Option<Guid>,
  targets: Vec<Guid>,
  data: Option<DataBlob>,
  runtime: Arc<dyn Runtime>,
}

impl Tensor {
  /// Build a standalone tensor bound to `runtime`.
  ///
  /// Most callers never call this directly — [`crate::graph::Graph::add_tensor`]
  /// does it for you against the graph's own runtime. It exists as a public
  /// constructor for the case a tensor is built ahead of time and handed to
  /// a graph via [`crate::graph::Graph::add_tensor_with`], which rejects it
  /// if `runtime` isn't the same backend the graph was built with.
  pub fn new(runtime: Arc<dyn Runtime>, shape: Vec<usize>, dtype: DType) -> Self {
    Self {
      fuid: Fuid::alloc(),
      shape,
      dtype,
      source: None,
      targets: Vec::new(),
      data: None,
      runtime,
    }
  }

  /// This tensor's unique identifier.
  #[inline]
  pub fn fuid(&self) -> Fuid {
    self.fuid
  }

  /// The runtime backend this tensor's eventual data will be drawn from.
  #[inline]
  pub fn runtime(&self) -> &Arc<dyn Runtime> {
    &self.runtime
  }

  /// Current shape.
  #[inline]
  pub fn shape(&self) -> &[usize] {
    &self.shape
  }

  /// Element type.
  #[inline]
  pub fn dtype(&self) -> DType {
    self.dtype
  }

  /// Byte size: product of `shape` times `dtype.size()`.
  pub fn bytes(&self) -> usize {
    self.shape.iter().product::<usize>() * self.dtype.size()
  }

  /// The operator that produces this tensor, if any.
  #[inline]
  pub fn source(&self) -> Option<Guid> {
    self.source
  }

  /// Operators that consume this tensor.
  #[inline]
  pub fn targets(&self) -> &[Guid] {
    &self.targets
  }

  /// Resolved data binding, once [`crate::graph::Graph::data_malloc`] has run.
  #[inline]
  pub fn data_blob(&self) -> Option<DataBlob> {
    self.data
  }

  /// Register `op` as an additional consumer. Called only by `Graph`.
  pub(crate) fn add_target(&mut self, op: Guid) {
    if !self.targets.contains(&op) {
      self.targets.push(op);
    }
  }

  /// Unregister `op` as a consumer. Called only by `Graph`/the optimizer.
  pub(crate) fn remove_target(&mut self, op: Guid) {
    self.targets.retain(|&t| t != op);
  }

  /// Set (or clear) the producer. Called only by `Graph`/the optimizer.
  pub(crate) fn set_source(&mut self, op: Option<Guid>) {
    self.source = op;
  }

  /// Bind resolved arena data. Called exactly once, by `data_malloc`.
  pub(crate) fn set_data_blob(&mut self, blob: DataBlob) {
    debug_assert!(self.data.is_none(), "data blob bound twice for {}", self.fuid);
    self.data = Some(blob);
  }

  /// Replace the shape. Called only during `shape_infer`.
  pub(crate) fn set_shape(&mut self, shape: Vec<usize>) {
    self.shape = shape;
  }
}

impl std::fmt::Display for Tensor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "Tensor {} shape={:?} dtype={:?}",
      self.fuid, self.shape, self.dtype
    )
  }
}
