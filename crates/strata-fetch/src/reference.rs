//! Rootfs reference parsing.
//!
//! References are URLs:
//! - `/var/rootfs` or the empty string: a host directory (empty means the
//!   configured default)
//! - `docker:///busybox#1.36`: an image on the default registry
//! - `docker://registry.example.com:5000/team/app`: an image on a given
//!   registry, tag `latest`

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use reqwest::Url;
use strata_common::{StrataError, StrataResult};

/// The public Docker registry.
pub const DOCKER_HUB: &str = "registry-1.docker.io";

/// Tag used when a reference names none.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed rootfs reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A directory on the host.
    Local(PathBuf),
    /// An image in a registry.
    Docker(DockerReference),
}

/// A `docker://` reference as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerReference {
    /// Registry host (with port), if one was given.
    pub host: Option<String>,
    /// Repository path as written.
    pub path: String,
    /// Tag, if one was given.
    pub tag: Option<String>,
}

/// A registry location with all defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReference {
    /// Registry host (with port).
    pub host: String,
    /// Repository within the registry.
    pub repository: String,
    /// Tag to pull.
    pub tag: String,
}

impl Reference {
    /// Parse a reference.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::InvalidReference`] for schemes other than
    /// `docker` and for `docker` references without a repository.
    pub fn parse(reference: &str) -> StrataResult<Self> {
        let reference = reference.trim();
        let invalid = |reason: &str| StrataError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let Ok(url) = Url::parse(reference) else {
            return Ok(Self::Local(PathBuf::from(reference)));
        };

        match url.scheme() {
            "docker" => {
                let host = url.host_str().filter(|h| !h.is_empty()).map(|h| match url.port() {
                    Some(port) => format!("{h}:{port}"),
                    None => h.to_string(),
                });
                let path = url.path().trim_start_matches('/').to_string();
                if path.is_empty() {
                    return Err(invalid("missing repository"));
                }
                let tag = url.fragment().filter(|t| !t.is_empty()).map(str::to_string);
                Ok(Self::Docker(DockerReference { host, path, tag }))
            }
            "file" => Ok(Self::Local(PathBuf::from(url.path()))),
            scheme => Err(invalid(&format!("unsupported scheme {scheme}"))),
        }
    }

    /// True for host directories.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl DockerReference {
    /// Apply the default host, implicit `library/` namespace and default tag.
    #[must_use]
    pub fn resolve(&self, default_host: &str) -> ResolvedReference {
        let host = self
            .host
            .clone()
            .unwrap_or_else(|| default_host.to_string());
        let repository = if host == DOCKER_HUB && !self.path.contains('/') {
            format!("library/{}", self.path)
        } else {
            self.path.clone()
        };
        ResolvedReference {
            host,
            repository,
            tag: self.tag.clone().unwrap_or_else(|| DEFAULT_TAG.to_string()),
        }
    }
}

impl FromStr for Reference {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Docker(docker) => {
                write!(
                    f,
                    "docker://{}/{}",
                    docker.host.as_deref().unwrap_or(""),
                    docker.path
                )?;
                if let Some(tag) = &docker.tag {
                    write!(f, "#{tag}")?;
                }
                Ok(())
            }
        }
    }
}
