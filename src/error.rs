//! Error taxonomy for the allocator and the graph.
//!
//! Structural invariant violations (a malformed graph, a misuse of the
//! allocator after its arena has been materialized, a shape-inference
//! disagreement) are programming errors: they are asserted against
//! unconditionally with [`assert!`]/[`panic!`] — never [`debug_assert!`],
//! since `SPEC_FULL.md` §7 requires these to abort in release builds too —
//! rather than threaded through a `Result`. Only the two genuinely
//! recoverable failure modes — running out of arena space while planning,
//! and discovering a cycle, dangling producer, or missing `topo_sort`
//! during the `optimize` → `shape_infer` → `data_malloc` pipeline — get an
//! `Error` type of their own.

use thiserror::Error;

/// Failure modes of the [`crate::allocator::Allocator`].
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum AllocError {
  /// The free-list and high-water mark both failed to provide `requested`
  /// contiguous bytes. Cannot happen with the append-only high-water-mark
  /// path (it never fails), so in practice this is unreachable today, but
  /// is kept for future bounded-arena variants.
  #[error("insufficient space: requested {requested} bytes, {available} available")]
  InsufficientSpace {
    /// Bytes requested by the failing `alloc` call.
    requested: usize,
    /// Bytes available via the free-list or tail at the time of failure.
    available: usize,
  },
}

/// Failure modes surfaced to the caller while driving a [`crate::graph::Graph`]
/// through `optimize` → `shape_infer` → `data_malloc`.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum GraphError {
  /// `topo_sort` made a full pass over the unsorted operators without
  /// moving any of them: either a cycle exists, or an operator's input
  /// names a producer that isn't in the graph.
  #[error("topological sort failed: cycle or dangling producer among {remaining} operator(s)")]
  NotAcyclic {
    /// Number of operators that could not be ordered.
    remaining: usize,
  },
  /// `shape_infer` was called before a successful `topo_sort`. Unlike
  /// `shape_infer`, `data_malloc` attempts the sort itself and fails with
  /// `NotAcyclic` instead if that attempt doesn't succeed.
  #[error("graph is not topologically sorted")]
  NotSorted,
  /// An operator's `infer_shape` returned `None`: its inputs are
  /// incompatible (e.g. mismatched MatMul batch prefixes). `Graph::shape_infer`
  /// never returns this variant — it panics with this type's `Display` text
  /// instead, since a well-formed graph's operators should never disagree
  /// with their own recorded input shapes. Kept as an enum variant purely so
  /// the panic message is defined in one place alongside its siblings.
  #[error("shape inference failed for operator {guid}")]
  ShapeInferenceFailed {
    /// The operator whose inputs could not be reconciled.
    guid: u64,
  },
}
