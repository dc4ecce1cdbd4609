//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::Result;
use serde::Serialize;
use serde_json::json;
use strata_cake::{Cake as _, LayerId};
use strata_common::ByteSize;

use crate::config::{DriverKind, StrataConfig};
use crate::provider::Provider;
use crate::spec::{DiskLimitScope, RootfsSpec};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Strata - container rootfs layer store
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for strata data (overrides the config file)
    #[arg(long, global = true, env = "STRATA_ROOT")]
    pub root: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Graph driver (overrides the config file)
    #[arg(long, global = true, value_enum)]
    pub driver: Option<DriverKind>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Layer store commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create a container rootfs
    Create {
        /// Container handle
        id: String,

        /// Rootfs reference: a host path or docker://[host]/repo[#tag]
        #[arg(long, default_value = "")]
        rootfs: String,

        /// Registry user name
        #[arg(long, default_value = "")]
        username: String,

        /// Registry password
        #[arg(long, env = "STRATA_REGISTRY_PASSWORD", default_value = "", hide_env_values = true)]
        password: String,

        /// Re-own the image for the configured user namespace
        #[arg(long)]
        namespaced: bool,

        /// Disk limit, e.g. 512m or 1Gi
        #[arg(long)]
        disk_limit: Option<ByteSize>,

        /// What the disk limit covers
        #[arg(long, value_enum, default_value_t = DiskLimitScope::Total)]
        scope: DiskLimitScope,
    },

    /// Destroy a container rootfs
    Destroy {
        /// Container handle
        id: String,
    },

    /// Show disk usage of a container
    Metrics {
        /// Container handle
        id: String,
    },

    /// Collect unused layers
    Gc,

    /// Resolve the persistent images and show what is retained
    Retain,

    /// List the leaves of the layer graph
    Leaves,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

impl Cli {
    fn load_config(&self) -> Result<StrataConfig> {
        let mut config = match &self.config {
            Some(path) => StrataConfig::load(path)?,
            None => StrataConfig::default(),
        };
        if let Some(root) = &self.root {
            config.graph_root = Some(root.clone());
        }
        if let Some(driver) = self.driver {
            config.driver = driver;
        }
        Ok(config)
    }

    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let config = self.load_config()?;
        let provider = Provider::build(&config)?;
        let ordinator = provider.ordinator();

        match self.command {
            Commands::Create {
                id,
                rootfs,
                username,
                password,
                namespaced,
                disk_limit,
                scope,
            } => {
                let spec = RootfsSpec {
                    rootfs,
                    username,
                    password,
                    namespaced,
                    quota_size: disk_limit.map_or(0, |limit| limit.as_quota()),
                    quota_scope: scope,
                };
                let created = ordinator.create(&id, &spec).await?;
                print_json(&created)
            }

            Commands::Destroy { id } => {
                ordinator.destroy(&id).await?;
                print_json(&json!({ "id": id, "destroyed": true }))
            }

            Commands::Metrics { id } => print_json(&ordinator.metrics(&id).await?),

            Commands::Gc => {
                let retained = provider.retain_persistent_images().await;
                let before = provider.cake().all().len();
                ordinator.gc().await?;
                let after = provider.cake().all().len();
                print_json(&json!({
                    "retained": retained.len(),
                    "layers_before": before,
                    "layers_after": after,
                }))
            }

            Commands::Retain => {
                let retained: Vec<String> = provider
                    .retain_persistent_images()
                    .await
                    .iter()
                    .map(LayerId::graph_id)
                    .collect();
                print_json(&retained)
            }

            Commands::Leaves => {
                let leaves: Vec<String> = provider
                    .cake()
                    .get_all_leaves()?
                    .iter()
                    .map(LayerId::graph_id)
                    .collect();
                print_json(&leaves)
            }
        }
    }
}
