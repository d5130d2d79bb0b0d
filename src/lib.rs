#![deny(missing_docs)]

//! An ahead-of-time tensor computation graph: a DAG of operator nodes and
//! tensor edges, a peephole optimizer that runs before anything is
//! materialized, and an offset allocator that plans every tensor's byte
//! range inside one contiguous arena before asking a [`Runtime`] for the
//! memory to back it.
//!
//! ```
//! use std::sync::Arc;
//! use tensorgraph::{DType, Graph, OpKind, SystemRuntime};
//!
//! let mut graph = Graph::new(Arc::new(SystemRuntime::new()));
//! let a = graph.add_tensor(vec![2, 3], DType::F32);
//! let b = graph.add_tensor(vec![4, 3], DType::F32);
//! let c = graph.add_tensor(vec![1, 1], DType::F32);
//! graph.add_operator_and_connect(
//!     OpKind::MatMul { trans_a: false, trans_b: true },
//!     vec![a, b],
//!     vec![c],
//! );
//! graph.optimize();
//! graph.topo_sort();
//! graph.shape_infer().unwrap();
//! assert_eq!(graph.get_tensor(c).unwrap().shape(), &[2, 4]);
//! graph.data_malloc().unwrap();
//! assert!(graph.check_valid());
//! ```

pub mod allocator;
pub mod error;
pub mod graph;
pub mod ids;
pub mod op;
pub mod optimize;
pub mod runtime;
pub mod tensor;

pub use allocator::Allocator;
pub use error::{AllocError, GraphError};
pub use graph::Graph;
pub use ids::{Fuid, Guid};
pub use op::{OpKind, Operator};
pub use runtime::{Runtime, SystemRuntime};
pub use tensor::{DType, DataBlob, Tensor};
