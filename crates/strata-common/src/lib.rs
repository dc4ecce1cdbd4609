//! # strata-common
//!
//! Shared utilities and types for the Strata layer store.
//!
//! This crate provides common functionality used across all Strata crates:
//! - The error taxonomy shared by the cake, the fetchers and the ordinator
//! - Standard filesystem paths
//! - Byte size parsing for quotas and GC thresholds
//! - A bounded retry policy
//! - The command runner used for format and mount operations

#![warn(missing_docs)]

pub mod command;
pub mod error;
pub mod paths;
pub mod retry;
pub mod size;

pub use command::{CommandRunner, SystemRunner};
pub use error::{StrataError, StrataResult};
pub use paths::StrataPaths;
pub use retry::RetryPolicy;
pub use size::ByteSize;
