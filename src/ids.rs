//! Monotonically assigned identifiers for tensors and operators.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! monotonic_id {
  ($(#[$meta:meta])* $name:ident) => {
    $(#[$meta])*
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct $name(u64);

    impl $name {
      fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
      }

      /// The raw numeric value, used for `Display` rendering and tests.
      #[inline]
      pub fn get(self) -> u64 {
        self.0
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
      }
    }
  };
}

monotonic_id!(
  /// Unique identifier for a [`crate::tensor::Tensor`].
  Fuid
);
monotonic_id!(
  /// Unique identifier for an [`crate::op::Operator`].
  Guid
);

impl Fuid {
  /// Allocate the next `Fuid` in process-wide monotonic order.
  pub(crate) fn alloc() -> Self {
    Self::next()
  }
}

impl Guid {
  /// Allocate the next `Guid` in process-wide monotonic order.
  pub(crate) fn alloc() -> Self {
    Self::next()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ids_are_monotonic_and_distinct() {
    let a = Fuid::alloc();
    let b = Fuid::alloc();
    assert!(b.get() > a.get());
    let x = Guid::alloc();
    let y = Guid::alloc();
    assert!(y.get() > x.get());
  }
}
