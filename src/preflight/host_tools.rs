//! Host tool and privilege validation.

use std::collections::HashSet;

use nix::unistd::{geteuid, Uid};

use super::CheckResult;
use crate::config::Isolation;
use crate::process::which;
use crate::step::PackageManager;

/// Required host tools with their install suggestions.
const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("sh", "Run installer scripts", "install a POSIX shell"),
    ("df", "Check free disk space", "sudo apt-get install coreutils"),
];

/// Check that all tools needed under `isolation` are installed.
///
/// Under host isolation step commands run on the host, so the package
/// manager's programs must exist here too.
pub fn check_host_tools(isolation: Isolation, package_manager: &PackageManager) -> Vec<CheckResult> {
    let mut results: Vec<CheckResult> = REQUIRED_TOOLS
        .iter()
        .map(|(tool, purpose, install)| check_tool(tool, purpose, install))
        .collect();

    match isolation {
        Isolation::Chroot => results.push(check_tool(
            "chroot",
            "Isolate step commands",
            "sudo apt-get install coreutils",
        )),
        Isolation::Host => {
            for program in [package_manager.update.first(), package_manager.install.first()]
                .into_iter()
                .flatten()
            {
                results.push(check_tool(
                    program,
                    "Package manager (host isolation)",
                    "install it or switch to chroot isolation",
                ));
            }
        }
    }
    let mut seen = HashSet::new();
    results.retain(|r| seen.insert(r.name.clone()));
    results
}

fn check_tool(tool: &str, purpose: &str, install_cmd: &str) -> CheckResult {
    match which(tool) {
        Some(path) => CheckResult::pass(
            format!("{} tool", tool),
            format!("Found at {} ({})", path.display(), purpose),
        ),
        None => CheckResult::fail(
            format!("{} tool", tool),
            format!("Not found (needed for: {})", purpose),
            install_cmd,
        ),
    }
}

/// chroot(2) needs root; host isolation runs unprivileged.
pub fn check_privileges(isolation: Isolation) -> CheckResult {
    privileges_for(isolation, geteuid())
}

fn privileges_for(isolation: Isolation, euid: Uid) -> CheckResult {
    match isolation {
        Isolation::Chroot if euid.is_root() => CheckResult::pass("Privileges", "running as root"),
        Isolation::Chroot => CheckResult::fail(
            "Privileges",
            format!("chroot isolation needs root (euid {})", euid),
            "re-run with sudo, or set isolation = \"host\" for unprivileged fixtures",
        ),
        Isolation::Host => CheckResult::warn(
            "Privileges",
            "host isolation: step commands run directly on this machine",
        ),
    }
}
