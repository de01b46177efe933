//! Post-build verification of the staged rootfs.
//!
//! Runs after the last step and before the image is published. If anything
//! listed here is missing the build fails: a half-working toolchain image is
//! never published.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::BuildError;
use crate::image::resolve_in_rootfs;
use crate::step::validate_image_path;

/// `[verify]` section of a recipe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifySpec {
    /// Must exist as regular files with an execute bit.
    pub executables: Vec<String>,
    /// Must exist as directories with no entries.
    pub empty_dirs: Vec<String>,
}

impl VerifySpec {
    pub fn validate(&self) -> Result<()> {
        for path in self.executables.iter().chain(&self.empty_dirs) {
            if let Err(reason) = validate_image_path(path) {
                bail!("{}", reason);
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.executables.is_empty() && self.empty_dirs.is_empty()
    }
}

/// Check `rootfs` against `spec`, returning the number of checks passed.
pub fn verify_rootfs(rootfs: &Path, spec: &VerifySpec) -> Result<usize, BuildError> {
    if spec.is_empty() {
        return Ok(0);
    }
    println!("\n  Verifying image...");

    let mut failures = Vec::new();
    let mut passed = 0;

    for exe in &spec.executables {
        match check_executable(rootfs, exe) {
            Ok(()) => passed += 1,
            Err(reason) => failures.push(format!("{}: {}", exe, reason)),
        }
    }

    for dir in &spec.empty_dirs {
        match check_empty_dir(rootfs, dir) {
            Ok(()) => passed += 1,
            Err(reason) => failures.push(format!("{}: {}", dir, reason)),
        }
    }

    let total = passed + failures.len();
    if failures.is_empty() {
        println!("  ✓ Verification PASSED ({}/{} checks)", passed, total);
        Ok(passed)
    } else {
        println!("  ✗ Verification FAILED ({}/{} checks)", passed, total);
        for failure in &failures {
            println!("    ✗ {}", failure);
        }
        Err(BuildError::VerificationFailed { failures })
    }
}

fn check_executable(rootfs: &Path, path: &str) -> Result<(), String> {
    let resolved = resolve_in_rootfs(rootfs, path).ok_or("missing")?;
    let meta = fs::metadata(&resolved).map_err(|_| "missing".to_string())?;
    if !meta.is_file() {
        return Err("not a regular file".into());
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err("not executable".into());
    }
    Ok(())
}

fn check_empty_dir(rootfs: &Path, path: &str) -> Result<(), String> {
    let resolved = resolve_in_rootfs(rootfs, path).ok_or("missing")?;
    if !resolved.is_dir() {
        return Err("missing or not a directory".into());
    }
    let count = fs::read_dir(&resolved)
        .map_err(|e| e.to_string())?
        .count();
    if count > 0 {
        return Err(format!("not empty ({} entries)", count));
    }
    Ok(())
}
