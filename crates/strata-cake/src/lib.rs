//! Strata layer graph.
//!
//! The "cake" is a graph of filesystem layers: immutable image layers,
//! writable container layers on top of them, and namespaced clones of image
//! layers whose files have been re-owned for a user namespace. This crate
//! provides:
//!
//! - [`LayerId`]: the kinds of layer identity and how they map to graph ids
//! - [`Cake`]: the layer graph contract
//! - [`DriverCake`]: a graph backed by a [`driver::GraphDriver`]
//! - [`NamespacedCake`]: relationship tracking for namespaced clones
//! - [`cleaner`]: threshold-driven garbage collection

pub mod archive;
pub mod cake;
pub mod cleaner;
pub mod driver;
pub mod driver_cake;
pub mod graph;
pub mod id;
pub mod namespaced;
pub mod relations;
pub mod retainer;

pub use cake::{Cake, LayerRecord};
pub use driver_cake::DriverCake;
pub use graph::Graph;
pub use id::LayerId;
pub use namespaced::NamespacedCake;
pub use retainer::{RetainCheck, Retainer};
