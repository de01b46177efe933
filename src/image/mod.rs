//! Base images, environment images and the store that holds them.

pub mod layer;
pub mod store;

pub use layer::{Layer, LayerSummary, Snapshot};
pub use store::{ImageStore, WorkDir};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::step::ProvisioningStep;

/// Starting filesystem snapshot, referenced as `name:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseImage {
    pub name: String,
    pub tag: String,
}

impl BaseImage {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Result<Self> {
        let base = Self {
            name: name.into(),
            tag: tag.into(),
        };
        base.validate()?;
        Ok(base)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_tag(&self.tag)
    }
}

impl fmt::Display for BaseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl FromStr for BaseImage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((name, tag)) => BaseImage::new(name, tag),
            None => bail!("base image reference '{}' must be name:tag", s),
        }
    }
}

/// Image names: lowercase path segments of `[a-z0-9._-]`.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("image name is empty");
    }
    for segment in name.split('/') {
        if segment.is_empty() || segment.starts_with('.') {
            bail!("invalid image name '{}'", name);
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        {
            bail!("invalid image name '{}' (allowed: a-z 0-9 . _ - /)", name);
        }
    }
    Ok(())
}

/// Tags: `[A-Za-z0-9._-]`, not starting with `.` or `-`, at most 128 chars.
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() || tag.len() > 128 {
        bail!("tag '{}' must be 1-128 characters", tag);
    }
    if tag.starts_with('.') || tag.starts_with('-') {
        bail!("tag '{}' must not start with '.' or '-'", tag);
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
    {
        bail!("invalid tag '{}' (allowed: A-Z a-z 0-9 . _ -)", tag);
    }
    Ok(())
}

/// Recorded alongside an imported base rootfs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseRecord {
    pub base: BaseImage,
    /// Snapshot digest of the base rootfs at import time.
    pub digest: String,
    pub imported_at: DateTime<Utc>,
}

/// Metadata of a fully provisioned image (`image.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentImage {
    /// Short id: first 12 hex characters of the content digest.
    pub id: String,
    /// `sha256:<hex>` over the base digest and every layer digest.
    pub digest: String,
    pub tag: Option<String>,
    pub base: BaseImage,
    pub base_digest: String,
    /// Digest of everything that went into the build; used to skip rebuilds.
    pub input_digest: String,
    pub steps: Vec<ProvisioningStep>,
    pub layers: Vec<LayerSummary>,
    pub built_at: DateTime<Utc>,
}

impl EnvironmentImage {
    /// Content digest: independent of build time and tag.
    pub fn content_digest(base_digest: &str, layers: &[Layer]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(base_digest.as_bytes());
        for layer in layers {
            hasher.update(b"\n");
            hasher.update(layer.digest.as_bytes());
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    /// At most 12 characters; tolerates short or hand-edited digests.
    pub fn short_id(digest: &str) -> String {
        digest.trim_start_matches("sha256:").chars().take(12).collect()
    }
}

/// Resolve an absolute image path to a host path under `rootfs`.
///
/// Symlinks are followed the way they would be inside the image: absolute
/// targets restart at `rootfs` and `..` never climbs above it. Returns `None`
/// if a component is missing or there are too many link hops.
pub fn resolve_in_rootfs(rootfs: &Path, image_path: &str) -> Option<PathBuf> {
    let mut current = rootfs.to_path_buf();
    let mut hops = 0;
    let mut pending: Vec<String> = split_rev(image_path);

    while let Some(part) = pending.pop() {
        match part.as_str() {
            "." => continue,
            ".." => {
                if current != rootfs {
                    current.pop();
                }
                continue;
            }
            _ => {}
        }
        let next = current.join(&part);
        let meta = fs::symlink_metadata(&next).ok()?;
        if !meta.file_type().is_symlink() {
            current = next;
            continue;
        }
        hops += 1;
        if hops > 40 {
            return None;
        }
        let target = fs::read_link(&next).ok()?.to_string_lossy().into_owned();
        if target.starts_with('/') {
            current = rootfs.to_path_buf();
        }
        pending.extend(split_rev(&target));
    }
    Some(current)
}

fn split_rev(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .rev()
        .collect()
}
