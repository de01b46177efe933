//! Disk space check.
//!
//! A build holds the base copy, the staging rootfs and the published image
//! on the store filesystem at once.

use super::CheckResult;
use crate::cancel::CancelSignal;
use crate::process::Cmd;
use std::path::Path;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Check that at least `required` bytes are free where `store_dir` lives.
pub async fn check_disk_space(store_dir: &Path, required: u64) -> CheckResult {
    match available_space(store_dir).await {
        Some(available) => {
            let available_gb = available as f64 / GB;
            let required_gb = required as f64 / GB;

            if available >= required {
                CheckResult::pass(
                    "Disk space",
                    format!("{:.1} GB available (need {:.1} GB)", available_gb, required_gb),
                )
            } else {
                CheckResult::fail(
                    "Disk space",
                    format!(
                        "Only {:.1} GB available, need {:.1} GB",
                        available_gb, required_gb
                    ),
                    "Free up disk space or point --store at a larger filesystem",
                )
            }
        }
        None => CheckResult::fail(
            "Disk space",
            "Failed to check available disk space",
            "Ensure df command is available",
        ),
    }
}

/// Available bytes on the filesystem holding `path` (or its nearest
/// existing ancestor).
pub async fn available_space(path: &Path) -> Option<u64> {
    let existing = path.ancestors().find(|p| p.exists()).unwrap_or(Path::new("."));

    Cmd::new("df")
        .args(["--output=avail", "-B1"])
        .arg_path(existing)
        .allow_fail()
        .run(&CancelSignal::never())
        .await
        .ok()
        .filter(|r| r.success())
        .and_then(|r| {
            // Skip header line, get first number
            r.stdout
                .lines()
                .nth(1)
                .and_then(|line| line.trim().parse::<u64>().ok())
        })
}
