//! Rebuild detection.
//!
//! Hashes every input of a build. If the requested tag already points at an
//! image built from the same inputs, the build is skipped.

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::image::{EnvironmentImage, ImageStore};
use crate::step::{PackageManager, ProvisioningStep};
use crate::verify::VerifySpec;

#[derive(Serialize)]
struct Inputs<'a> {
    base_digest: &'a str,
    steps: &'a [ProvisioningStep],
    package_manager: &'a PackageManager,
    verify: &'a VerifySpec,
}

/// Digest over everything that determines the built image.
pub fn input_digest(
    base_digest: &str,
    steps: &[ProvisioningStep],
    package_manager: &PackageManager,
    verify: &VerifySpec,
) -> String {
    let inputs = Inputs {
        base_digest,
        steps,
        package_manager,
        verify,
    };
    // Step payloads use BTreeSet/BTreeMap, so the JSON is canonical.
    let bytes = serde_json::to_vec(&inputs).unwrap_or_default();
    format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))
}

/// The image `tag` points at, if it was built from `input_digest` and is
/// still present.
pub fn cached_image(
    store: &ImageStore,
    tag: &str,
    input_digest: &str,
) -> Result<Option<EnvironmentImage>> {
    let Some(id) = store.read_tag(tag)? else {
        return Ok(None);
    };
    if !store.image_rootfs(&id).is_dir() {
        return Ok(None);
    }
    let image = store.load_image(&id)?;
    if image.input_digest == input_digest {
        Ok(Some(image))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepKind;

    fn steps(packages: &[&str]) -> Vec<ProvisioningStep> {
        vec![ProvisioningStep::new(
            0,
            StepKind::PackageInstall {
                packages: packages.iter().map(|s| s.to_string()).collect(),
            },
        )]
    }

    #[test]
    fn test_input_digest_stable() {
        let pm = PackageManager::default();
        let verify = VerifySpec::default();
        let a = input_digest("base", &steps(&["curl", "gcc"]), &pm, &verify);
        // Package order in the recipe does not matter.
        let b = input_digest("base", &steps(&["gcc", "curl"]), &pm, &verify);
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
    }

    #[test]
    fn test_input_digest_changes_with_inputs() {
        let pm = PackageManager::default();
        let verify = VerifySpec::default();
        let a = input_digest("base", &steps(&["curl"]), &pm, &verify);
        assert_ne!(a, input_digest("other-base", &steps(&["curl"]), &pm, &verify));
        assert_ne!(a, input_digest("base", &steps(&["wget"]), &pm, &verify));

        let mut alpine = PackageManager::default();
        alpine.install = vec!["apk".into(), "add".into()];
        assert_ne!(a, input_digest("base", &steps(&["curl"]), &alpine, &verify));
    }

    #[test]
    fn test_no_cached_image_without_tag() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::open(dir.path()).unwrap();
        assert!(cached_image(&store, "dev", "sha256:x").unwrap().is_none());
    }
}
