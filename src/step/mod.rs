//! Provisioning steps.
//!
//! A build is an ordered list of [`ProvisioningStep`]s applied to a staging
//! rootfs. Each step is one of three kinds:
//!
//! | Kind | Recipe `kind` | Effect |
//! |------|---------------|--------|
//! | [`StepKind::PackageInstall`] | `package-install` | update index, install packages |
//! | [`StepKind::RemoteScriptInstall`] | `remote-script` | fetch over HTTPS, verify, execute |
//! | [`StepKind::Cleanup`] | `cleanup` | empty cache/metadata paths |
//!
//! Payloads are checked by [`ProvisioningStep::validate`] before the first
//! step of a build runs, so a malformed step never causes network traffic.

pub mod builder;
pub mod context;
pub mod executor;

pub use builder::{BuildRequest, BuildState, EnvironmentBuilder};
pub use context::BuildContext;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};
use std::time::Duration;

use crate::error::{BuildError, StepRef};

/// One declared unit of environment modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningStep {
    /// Position in the declared sequence.
    pub order: usize,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Overrides the configured per-step timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Step kind and its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepKind {
    PackageInstall {
        packages: BTreeSet<String>,
    },
    #[serde(rename = "remote-script")]
    RemoteScriptInstall {
        url: String,
        /// Mandatory: there is no implicit trust in fetched content.
        verify: VerificationPolicy,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_interpreter")]
        interpreter: String,
    },
    Cleanup {
        paths: BTreeSet<String>,
        /// Entry names preserved inside cleaned directories.
        #[serde(default)]
        keep: BTreeSet<String>,
    },
}

fn default_interpreter() -> String {
    "sh".to_string()
}

/// Integrity policy for remotely fetched installer content.
///
/// In a recipe: `verify = { sha256 = "<hex>" }` or `verify = "insecure-skip"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationPolicy {
    /// Content must hash to this SHA-256 digest (hex).
    Sha256(String),
    /// Explicit opt-out. Logged as a warning on every use.
    InsecureSkip,
}

impl StepKind {
    /// Recipe label for this kind.
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::PackageInstall { .. } => "package-install",
            StepKind::RemoteScriptInstall { .. } => "remote-script",
            StepKind::Cleanup { .. } => "cleanup",
        }
    }

    /// Payload keys a step of this kind accepts, besides `kind` itself.
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            StepKind::PackageInstall { .. } => &["packages"],
            StepKind::RemoteScriptInstall { .. } => &["url", "verify", "args", "interpreter"],
            StepKind::Cleanup { .. } => &["paths", "keep"],
        }
    }
}

impl ProvisioningStep {
    pub fn new(order: usize, kind: StepKind) -> Self {
        Self {
            order,
            kind,
            timeout_secs: None,
        }
    }

    pub fn step_ref(&self) -> StepRef {
        StepRef {
            order: self.order,
            kind: self.kind.label(),
        }
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }

    /// One-line description for progress output.
    pub fn summary(&self) -> String {
        match &self.kind {
            StepKind::PackageInstall { packages } => {
                packages.iter().cloned().collect::<Vec<_>>().join(" ")
            }
            StepKind::RemoteScriptInstall { url, args, .. } => {
                if args.is_empty() {
                    url.clone()
                } else {
                    format!("{} {}", url, args.join(" "))
                }
            }
            StepKind::Cleanup { paths, .. } => paths.iter().cloned().collect::<Vec<_>>().join(" "),
        }
    }

    /// Check the payload against its kind's structural constraints.
    pub fn validate(&self, require_pinned_versions: bool) -> Result<(), BuildError> {
        let malformed = |reason: String| BuildError::MalformedStepSpec {
            step: self.step_ref(),
            reason,
        };

        if self.timeout_secs == Some(0) {
            return Err(malformed("timeout_secs must be greater than zero".into()));
        }

        match &self.kind {
            StepKind::PackageInstall { packages } => {
                if packages.is_empty() {
                    return Err(malformed("package set is empty".into()));
                }
                for package in packages {
                    validate_package(package, require_pinned_versions).map_err(malformed)?;
                }
            }
            StepKind::RemoteScriptInstall {
                url,
                verify,
                interpreter,
                ..
            } => {
                validate_url(url).map_err(malformed)?;
                if let VerificationPolicy::Sha256(digest) = verify {
                    validate_sha256(digest).map_err(malformed)?;
                }
                if interpreter.is_empty() || interpreter.chars().any(char::is_whitespace) {
                    return Err(malformed(format!("invalid interpreter '{}'", interpreter)));
                }
            }
            StepKind::Cleanup { paths, keep } => {
                if paths.is_empty() {
                    return Err(malformed("cleanup path set is empty".into()));
                }
                for path in paths {
                    validate_image_path(path).map_err(malformed)?;
                }
                for name in keep {
                    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                        return Err(malformed(format!(
                            "keep entry '{}' must be a plain file name",
                            name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Package manager commands used by `package-install` steps.
///
/// Defaults target apt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageManager {
    /// Refreshes the repository index before installing. Empty to skip.
    pub update: Vec<String>,
    /// Install command; package identifiers are appended.
    pub install: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for PackageManager {
    fn default() -> Self {
        Self {
            update: vec!["apt-get".into(), "update".into()],
            install: vec![
                "apt-get".into(),
                "install".into(),
                "-y".into(),
                "--no-install-recommends".into(),
            ],
            env: BTreeMap::from([("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())]),
        }
    }
}

impl PackageManager {
    pub fn validate(&self) -> Result<(), String> {
        if self.install.is_empty() || self.install[0].is_empty() {
            return Err("package_manager.install must name a command".into());
        }
        if self.update.first().is_some_and(|p| p.is_empty()) {
            return Err("package_manager.update has an empty command name".into());
        }
        Ok(())
    }
}

fn validate_package(package: &str, require_pin: bool) -> Result<(), String> {
    if package.is_empty() {
        return Err("empty package identifier".into());
    }
    if package.starts_with('-') {
        return Err(format!("package identifier '{}' looks like an option", package));
    }
    if let Some(bad) = package
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || "._+-:=~/".contains(*c)))
    {
        return Err(format!(
            "package identifier '{}' contains invalid character {:?}",
            package, bad
        ));
    }
    match package.split_once('=') {
        Some((name, version)) if name.is_empty() || version.is_empty() => {
            Err(format!("malformed version pin '{}'", package))
        }
        None if require_pin => Err(format!(
            "package '{}' is not pinned (expected name=version)",
            package
        )),
        _ => Ok(()),
    }
}

fn validate_url(url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid URL '{}': {}", url, e))?;
    if parsed.scheme() != "https" {
        return Err(format!(
            "URL '{}' must use https (got '{}')",
            url,
            parsed.scheme()
        ));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(format!("URL '{}' has no host", url));
    }
    Ok(())
}

fn validate_sha256(digest: &str) -> Result<(), String> {
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!(
            "sha256 digest '{}' must be 64 hexadecimal characters",
            digest
        ));
    }
    Ok(())
}

/// An absolute path inside the image, not `/` itself, with no `..`.
pub fn validate_image_path(path: &str) -> Result<(), String> {
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err(format!("path '{}' must be absolute", path));
    }
    let mut normal = 0;
    for component in p.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(_) => normal += 1,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(format!("path '{}' must not contain '..'", path));
            }
        }
    }
    if normal == 0 {
        return Err(format!("path '{}' refers to the image root", path));
    }
    Ok(())
}
