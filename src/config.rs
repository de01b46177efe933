//! Builder configuration.
//!
//! Settings resolve in tiers, highest first:
//!
//! 1. Command-line flags (`--store`)
//! 2. Environment variables (`ENVBUILD_STORE`, `ENVBUILD_ISOLATION`, `ENVBUILD_STEP_TIMEOUT`)
//! 3. Config file (`--config <file>`, or `envbuild.toml` in the working directory)
//! 4. Built-in defaults
//!
//! # Example
//!
//! ```toml
//! store_dir = "/var/lib/envbuild"
//! isolation = "chroot"
//! step_timeout_secs = 3600
//! min_tls = "1.3"
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const STORE_ENV: &str = "ENVBUILD_STORE";
pub const ISOLATION_ENV: &str = "ENVBUILD_ISOLATION";
pub const STEP_TIMEOUT_ENV: &str = "ENVBUILD_STEP_TIMEOUT";

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "envbuild.toml";
pub const DEFAULT_STORE_DIR: &str = ".envbuild";
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MIN_DISK_SPACE_GB: u64 = 5;

/// How step commands are executed against the staging rootfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// `chroot <rootfs> <command>`. Requires root.
    Chroot,
    /// Run on the host with the working directory and `ENVBUILD_ROOT`
    /// pointing at the rootfs.
    Host,
}

impl FromStr for Isolation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chroot" => Ok(Isolation::Chroot),
            "host" => Ok(Isolation::Host),
            other => bail!("unknown isolation mode '{}' (expected 'chroot' or 'host')", other),
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Isolation::Chroot => f.write_str("chroot"),
            Isolation::Host => f.write_str("host"),
        }
    }
}

/// Minimum TLS version accepted when fetching installers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsFloor {
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

impl TlsFloor {
    pub fn to_reqwest(self) -> reqwest::tls::Version {
        match self {
            TlsFloor::Tls12 => reqwest::tls::Version::TLS_1_2,
            TlsFloor::Tls13 => reqwest::tls::Version::TLS_1_3,
        }
    }
}

impl fmt::Display for TlsFloor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsFloor::Tls12 => f.write_str("TLS 1.2"),
            TlsFloor::Tls13 => f.write_str("TLS 1.3"),
        }
    }
}

/// Settings shared by every build run from this process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    /// Root of the image store (bases, images, tags, work directories).
    pub store_dir: PathBuf,
    pub isolation: Isolation,
    /// Default per-step timeout; a step's `timeout_secs` overrides it.
    pub step_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub min_tls: TlsFloor,
    pub min_disk_space_gb: u64,
    /// Reject package identifiers without an `=version` pin.
    pub require_pinned_versions: bool,
    /// Stream step command output to the terminal instead of capturing it.
    pub stream_output: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            isolation: Isolation::Chroot,
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            min_tls: TlsFloor::Tls12,
            min_disk_space_gb: DEFAULT_MIN_DISK_SPACE_GB,
            require_pinned_versions: false,
            stream_output: false,
        }
    }
}

impl BuilderConfig {
    /// Resolve configuration from all tiers.
    pub fn resolve(config_file: Option<&Path>, store_override: Option<PathBuf>) -> Result<Self> {
        let mut config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => {
                let local = Path::new(DEFAULT_CONFIG_FILE);
                if local.exists() {
                    Self::from_file(local)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;

        if let Some(store) = store_override {
            config.store_dir = store;
        }

        tracing::debug!(?config, "resolved builder configuration");
        Ok(config)
    }

    /// Load a TOML config file; missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(store) = lookup(STORE_ENV).filter(|s| !s.is_empty()) {
            self.store_dir = PathBuf::from(store);
        }
        if let Some(mode) = lookup(ISOLATION_ENV) {
            self.isolation = mode
                .parse()
                .with_context(|| format!("Invalid {}", ISOLATION_ENV))?;
        }
        if let Some(secs) = lookup(STEP_TIMEOUT_ENV) {
            self.step_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", STEP_TIMEOUT_ENV, secs))?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.step_timeout_secs == 0 {
            bail!("step_timeout_secs must be greater than zero");
        }
        if self.fetch_timeout_secs == 0 {
            bail!("fetch_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn min_disk_space_bytes(&self) -> u64 {
        self.min_disk_space_gb * 1024 * 1024 * 1024
    }
}
