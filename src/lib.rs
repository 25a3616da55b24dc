//! # madwave — Distributed Adaptive Multiwavelet Engine
//!
//! `madwave` represents functions over multidimensional domains as sharded,
//! adaptively refined multiwavelet coefficient trees, distributed across a
//! reliable messaging fabric and mutated in place by a small set of
//! recursive algorithms (project, compress, reconstruct, truncate,
//! multiply, differentiate, operator apply).
//!
//! ## Architecture
//!
//! Construction flows downward: a [`factory::TreeFactory`] builds a
//! [`tree::FunctionTree`] backed by a [`container::DistributedContainer`],
//! itself routed by a [`process_map::ProcessMap`] and delivered by the
//! [`rml::Rml`] messaging layer over a [`transport::Transport`]. Results
//! flow back up: the transport delivers bytes, the RML reassembles
//! messages and resumes parked tasks on the [`runtime::TaskRuntime`], and
//! tree algorithms emit the final tensors.
//!
//! ```rust,no_run
//! use madwave::factory::TreeFactory;
//! use madwave::rml::Rml;
//! use madwave::runtime::TaskRuntime;
//! use madwave::transport::build_world;
//! use madwave::tree::algorithms::project;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let transport = Arc::new(build_world(1).into_iter().next().unwrap());
//! let rml = Rml::new(transport.clone());
//! let runtime = TaskRuntime::current();
//!
//! let (tree, functor, refine, initial_level) = TreeFactory::<2>::new()
//!     .with_k(6)
//!     .with_thresh(1e-8)
//!     .with_functor(Arc::new(|x: &[f64; 2]| (-(x[0] * x[0] + x[1] * x[1])).exp()))
//!     .build(rml, runtime, transport)
//!     .expect("valid configuration");
//!
//! if let Some(functor) = functor {
//!     project(&tree, functor, initial_level, refine, true).await;
//! }
//! # }
//! ```

pub mod apply;
pub mod container;
pub mod error;
pub mod factory;
pub mod numerics;
pub mod process_map;
pub mod rml;
pub mod runtime;
pub mod tensor;
pub mod transport;
pub mod tree;

pub use error::{CoreError, RmlError, TransportError};

// Common imports, mirroring the ambient logging/serialization stack every
// module above is built on.
pub use ::tracing::{debug, error, info, instrument, warn};
pub use serde::{Deserialize, Serialize};
pub use thiserror::Error;
pub use uuid::Uuid;
