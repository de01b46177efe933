//! Declarative recipe files.
//!
//! A recipe names the base image, the ordered provisioning steps and the
//! checks the finished image must pass:
//!
//! ```toml
//! [base]
//! name = "ubuntu"
//! tag = "22.04"
//!
//! [image]
//! tag = "rust-qemu-dev"
//!
//! [[step]]
//! kind = "package-install"
//! packages = ["curl", "qemu-system", "build-essential"]
//!
//! [[step]]
//! kind = "remote-script"
//! url = "https://sh.rustup.rs"
//! verify = { sha256 = "..." }
//! args = ["-y"]
//!
//! [[step]]
//! kind = "cleanup"
//! paths = ["/var/lib/apt/lists"]
//!
//! [verify]
//! executables = ["/usr/bin/gcc", "/root/.cargo/bin/rustc"]
//! empty_dirs = ["/var/lib/apt/lists"]
//! ```
//!
//! Step order is the order of `[[step]]` tables in the file.

use anyhow::{Context, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

use crate::error::{BuildError, StepRef};
use crate::image::{validate_tag, BaseImage};
use crate::step::{BuildRequest, PackageManager, ProvisioningStep, StepKind};
use crate::verify::VerifySpec;

/// Parsed recipe file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    pub base: BaseImage,
    #[serde(default)]
    pub image: ImageSection,
    #[serde(default)]
    pub package_manager: PackageManager,
    #[serde(default, rename = "step")]
    pub steps: Vec<RecipeStep>,
    #[serde(default)]
    pub verify: VerifySpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageSection {
    /// Tag applied to the published image.
    pub tag: Option<String>,
}

/// A `[[step]]` table: kind-specific payload plus optional timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipeStep {
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Keys in the table that its kind does not define, sorted.
    #[serde(skip)]
    pub unknown_fields: Vec<String>,
}

const COMMON_STEP_FIELDS: &[&str] = &["kind", "timeout_secs"];

// serde cannot deny unknown fields through the flattened, tagged payload,
// so the table's keys are compared against the kind's fields instead.
impl<'de> Deserialize<'de> for RecipeStep {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Declared {
            #[serde(flatten)]
            kind: StepKind,
            #[serde(default)]
            timeout_secs: Option<u64>,
        }

        let table = toml::Table::deserialize(deserializer)?;
        let keys: Vec<String> = table.keys().cloned().collect();
        let declared: Declared = toml::Value::Table(table)
            .try_into()
            .map_err(D::Error::custom)?;

        let fields = declared.kind.fields();
        let mut unknown_fields: Vec<String> = keys
            .into_iter()
            .filter(|k| !COMMON_STEP_FIELDS.contains(&k.as_str()) && !fields.contains(&k.as_str()))
            .collect();
        unknown_fields.sort();

        Ok(RecipeStep {
            kind: declared.kind,
            timeout_secs: declared.timeout_secs,
            unknown_fields,
        })
    }
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid recipe {}", path.display()))
    }

    /// Parse a recipe and check everything that is not step-specific.
    pub fn from_toml(content: &str) -> Result<Self> {
        let recipe: Recipe = toml::from_str(content)?;
        recipe.base.validate().context("Invalid [base]")?;
        if let Some(tag) = &recipe.image.tag {
            validate_tag(tag).context("Invalid [image] tag")?;
        }
        recipe
            .package_manager
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid [package_manager]")?;
        recipe.verify.validate().context("Invalid [verify]")?;
        recipe.check_step_fields()?;
        Ok(recipe)
    }

    /// A misspelled key would otherwise be dropped and its default used.
    fn check_step_fields(&self) -> Result<(), BuildError> {
        for (order, step) in self.steps.iter().enumerate() {
            if let Some(field) = step.unknown_fields.first() {
                return Err(BuildError::MalformedStepSpec {
                    step: StepRef {
                        order,
                        kind: step.kind.label(),
                    },
                    reason: format!(
                        "unknown field `{}`, expected one of: {}",
                        field,
                        step.kind.fields().join(", ")
                    ),
                });
            }
        }
        Ok(())
    }

    /// Steps in declared order.
    pub fn provisioning_steps(&self) -> Vec<ProvisioningStep> {
        self.steps
            .iter()
            .enumerate()
            .map(|(order, step)| ProvisioningStep {
                order,
                kind: step.kind.clone(),
                timeout_secs: step.timeout_secs,
            })
            .collect()
    }

    /// Validate every step payload; nothing is fetched or executed.
    pub fn validate_steps(&self, require_pinned_versions: bool) -> Result<Vec<ProvisioningStep>, BuildError> {
        let steps = self.provisioning_steps();
        validate_all(&steps, require_pinned_versions)?;
        Ok(steps)
    }

    /// Request for building this recipe's image.
    pub fn build_request(&self, force: bool) -> BuildRequest {
        BuildRequest {
            base: self.base.clone(),
            steps: self.provisioning_steps(),
            package_manager: self.package_manager.clone(),
            verify: self.verify.clone(),
            tag: self.image.tag.clone(),
            force,
        }
    }

    /// URLs contacted by remote-script steps, in step order.
    pub fn remote_urls(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::RemoteScriptInstall { url, .. } => Some(url.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Pre-flight validation of a whole step list; first failure wins.
pub fn validate_all(steps: &[ProvisioningStep], require_pinned_versions: bool) -> Result<(), BuildError> {
    if steps.is_empty() {
        return Err(BuildError::EmptyStepList);
    }
    for step in steps {
        step.validate(require_pinned_versions)?;
    }
    Ok(())
}
