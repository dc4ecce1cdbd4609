//! # Strata
//!
//! Container root filesystems from a shared, garbage-collected layer graph.
//!
//! ## Features
//!
//! - **Image fetching**: host directories and registry images become layers
//!   in the graph, each registry blob downloaded at most once at a time
//! - **Disk quotas**: container layers on the overlay driver live on
//!   quota-sized loop filesystems, limited exclusively or with the image
//!   counted in
//! - **User namespaces**: images are cloned and re-owned once per id mapping
//! - **Garbage collection**: unused layers are pruned once the graph grows
//!   past a threshold, excluded from running alongside container churn
//!
//! ## Usage
//!
//! ```no_run
//! use strata::{Provider, RootfsSpec, StrataConfig};
//!
//! # async fn example() -> strata_common::StrataResult<()> {
//! let provider = Provider::build(&StrataConfig::default())?;
//! provider.retain_persistent_images().await;
//!
//! let rootfs = provider
//!     .ordinator()
//!     .create("my-container", &RootfsSpec::new("docker:///busybox"))
//!     .await?;
//! println!("{}", rootfs.root_path.display());
//!
//! provider.ordinator().destroy("my-container").await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod layer_creator;
pub mod metrics;
pub mod namespacer;
pub mod ordinator;
pub mod provider;
pub mod quota;
pub mod spec;
pub mod volume;

pub use config::StrataConfig;
pub use layer_creator::{ContainerLayerCreator, LayerCreator, Rootfs};
pub use ordinator::CakeOrdinator;
pub use provider::Provider;
pub use spec::{DiskLimitScope, RootfsSpec};
