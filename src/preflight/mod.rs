//! Preflight checks for environment builds.
//!
//! This module validates that all prerequisites are met BEFORE the first
//! step runs, so a build does not fail half way through a long package
//! install because of something detectable up front.
//!
//! # Checks Performed
//!
//! - **Host tools**: `sh`, `df`, and `chroot` under chroot isolation
//! - **Privileges**: root under chroot isolation
//! - **Disk space**: free space on the store filesystem
//! - **Network**: every remote installer URL answers over HTTPS
//! - **Store status**: base imported, cached image, leftover work dirs
//!
//! # Usage
//!
//! ```rust,ignore
//! use envbuild::preflight::PreflightChecker;
//!
//! let checker = PreflightChecker::new(&config, &store);
//! let report = checker.run_all(&recipe, &fetcher).await;
//!
//! if !report.is_ok() {
//!     report.print_summary();
//!     std::process::exit(1);
//! }
//! ```

mod disk_space;
mod host_tools;
mod network;

pub use disk_space::{available_space, check_disk_space};
pub use host_tools::{check_host_tools, check_privileges};
pub use network::check_network;

use crate::config::BuilderConfig;
use crate::fetch::Fetcher;
use crate::image::ImageStore;
use crate::recipe::Recipe;

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Name of the check
    pub name: String,
    /// Whether the check passed
    pub passed: bool,
    /// Passed, but worth the operator's attention
    pub warning: bool,
    /// Human-readable message
    pub message: String,
    /// Optional suggestion for fixing the issue
    pub suggestion: Option<String>,
}

impl CheckResult {
    /// Create a passing check result.
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            warning: false,
            message: message.into(),
            suggestion: None,
        }
    }

    /// Create a failing check result.
    pub fn fail(
        name: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            passed: false,
            warning: false,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    /// Create a warning check result (passes but with a note).
    pub fn warn(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            warning: true,
            message: message.into(),
            suggestion: None,
        }
    }
}

/// Comprehensive preflight report.
#[derive(Debug, Default)]
pub struct PreflightReport {
    /// All check results
    pub checks: Vec<CheckResult>,
    pub store_status: StoreStatus,
}

impl PreflightReport {
    /// Check if all preflight checks passed.
    pub fn is_ok(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Get all failing checks.
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    pub fn total_count(&self) -> usize {
        self.checks.len()
    }

    /// Print a summary of the preflight checks.
    pub fn print_summary(&self) {
        println!("=== Preflight Check Results ===\n");

        for check in &self.checks {
            let status = match (check.passed, check.warning) {
                (false, _) => "[FAIL]",
                (true, true) => "[WARN]",
                (true, false) => "[OK]",
            };
            println!("{} {}: {}", status, check.name, check.message);
            if let Some(suggestion) = &check.suggestion {
                println!("     Suggestion: {}", suggestion);
            }
        }

        println!();
        println!("=== Store Status ===\n");
        self.store_status.print();

        println!();
        if self.is_ok() {
            println!(
                "All preflight checks passed ({}/{})",
                self.passed_count(),
                self.total_count()
            );
        } else {
            println!(
                "Preflight checks failed: {} of {} passed",
                self.passed_count(),
                self.total_count()
            );
        }
    }
}

/// What the store already holds for this recipe.
#[derive(Debug, Default)]
pub struct StoreStatus {
    /// Base image imported
    pub has_base: bool,
    /// Image id the recipe's tag currently points at
    pub tagged_image: Option<String>,
    /// Work directories left by killed builds
    pub stale_work_dirs: usize,
}

impl StoreStatus {
    pub fn print(&self) {
        let status = |b: bool| if b { "[present]" } else { "[missing]" };

        println!("{}  Base image", status(self.has_base));
        match &self.tagged_image {
            Some(id) => println!("[present]  Tagged image ({})", id),
            None => println!("[none]     Tagged image"),
        }
        if self.stale_work_dirs > 0 {
            println!(
                "[stale]    {} leftover work director{}",
                self.stale_work_dirs,
                if self.stale_work_dirs == 1 { "y" } else { "ies" }
            );
        }
    }
}

/// Preflight checker for one recipe against one store.
pub struct PreflightChecker<'a> {
    config: &'a BuilderConfig,
    store: &'a ImageStore,
}

impl<'a> PreflightChecker<'a> {
    pub fn new(config: &'a BuilderConfig, store: &'a ImageStore) -> Self {
        Self { config, store }
    }

    /// Run all preflight checks and return a comprehensive report.
    pub async fn run_all(&self, recipe: &Recipe, fetcher: &dyn Fetcher) -> PreflightReport {
        let mut report = PreflightReport::default();

        report
            .checks
            .extend(check_host_tools(self.config.isolation, &recipe.package_manager));
        report.checks.push(check_privileges(self.config.isolation));
        report.checks.push(
            check_disk_space(self.store.root(), self.config.min_disk_space_bytes()).await,
        );
        report
            .checks
            .extend(check_network(fetcher, &recipe.remote_urls()).await);

        report.store_status = self.check_store_status(recipe);
        if !report.store_status.has_base {
            report.checks.push(CheckResult::fail(
                "Base image",
                format!("{} not found in {}", recipe.base, self.store.root().display()),
                format!("envbuild base import {} <rootfs-dir>", recipe.base),
            ));
        } else {
            report
                .checks
                .push(CheckResult::pass("Base image", recipe.base.to_string()));
        }

        report
    }

    fn check_store_status(&self, recipe: &Recipe) -> StoreStatus {
        let tagged_image = recipe
            .image
            .tag
            .as_deref()
            .and_then(|tag| self.store.read_tag(tag).ok().flatten());

        StoreStatus {
            has_base: matches!(self.store.base_record(&recipe.base), Ok(Some(_))),
            tagged_image,
            stale_work_dirs: self.store.stale_work_dirs().map(|d| d.len()).unwrap_or(0),
        }
    }
}
