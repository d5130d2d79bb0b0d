//! The runtime collaborator: raw arena memory acquisition/release.
//!
//! This crate treats the backend that actually owns bytes as external (see
//! `SPEC_FULL.md` §1/§6) and only depends on it through the [`Runtime`]
//! trait. [`SystemRuntime`] is the in-process implementation used by tests
//! and by callers with no device backend of their own.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;

/// A byte-addressable memory backend for the [`crate::allocator::Allocator`].
///
/// Implementations must return memory aligned to at least
/// [`crate::allocator::Allocator::alignment`] and must be able to
/// `dealloc` exactly what a prior `alloc` returned.
pub trait Runtime: fmt::Debug {
  /// Acquire a zeroed, byte-addressable region of at least `bytes` bytes.
  ///
  /// Returning a null pointer signals allocation failure; callers treat
  /// this the same way `std::alloc::alloc` treats OOM (abort via
  /// [`std::alloc::handle_alloc_error`]).
  fn alloc(&self, bytes: usize) -> *mut u8;

  /// Release a region previously returned by [`Runtime::alloc`] with the
  /// same `bytes`.
  ///
  /// # Safety
  ///
  /// `ptr` must be a pointer previously returned by `self.alloc(bytes)`
  /// and not already released.
  unsafe fn dealloc(&self, ptr: *mut u8, bytes: usize);
}

/// A minimal [`Runtime`] backed by the process heap.
///
/// Two `SystemRuntime`s never compare equal as the same backend — each
/// `Graph` holds its own `Arc<dyn Runtime>` and `Graph::add_tensor`
/// rejects tensors built against a different instance (see
/// [`crate::graph::Graph::add_tensor`]).
#[derive(Debug, Default)]
pub struct SystemRuntime {
  id: u64,
}

impl SystemRuntime {
  /// Alignment used for every arena this runtime hands out. Matches
  /// [`crate::allocator::DEFAULT_ALIGNMENT`], the widest scalar width in
  /// [`crate::tensor::DType`].
  const ALIGN: usize = crate::allocator::DEFAULT_ALIGNMENT;

  /// Create a new runtime instance with a fresh identity.
  pub fn new() -> Self {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    Self {
      id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
    }
  }

  fn layout(bytes: usize) -> Layout {
    // bytes == 0 is never requested by the allocator (alloc rounds up to
    // at least `alignment`), but guard anyway since `Layout::from_size_align`
    // rejects a zero-sized layout with non-power-of-two combinations only,
    // not zero itself; a zero-byte arena is legitimate for an empty graph.
    Layout::from_size_align(bytes.max(1), Self::ALIGN).expect("valid arena layout")
  }
}

impl Runtime for SystemRuntime {
  fn alloc(&self, bytes: usize) -> *mut u8 {
    let layout = Self::layout(bytes);
    // Safety: layout is non-zero-sized and alignment is a power of two.
    unsafe { alloc_zeroed(layout) }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, bytes: usize) {
    if ptr.is_null() {
      return;
    }
    dealloc(ptr, Self::layout(bytes));
  }
}

impl fmt::Display for SystemRuntime {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "SystemRuntime#{}", self.id)
  }
}
