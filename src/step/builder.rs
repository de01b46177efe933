//! Build orchestration: applies steps in declared order and publishes the
//! result.
//!
//! ```text
//! Pending -> Applying(0) -> Applying(1) -> ... -> Verifying -> Complete
//!    |            |              |                   |
//!    +------------+--------------+-------------------+--> Failed
//! ```
//!
//! Every step runs against a private work directory seeded from the base
//! rootfs. Nothing is visible in the store until [`ImageStore::publish`]
//! renames the finished tree into place; on any error the work directory is
//! dropped and deleted.

use chrono::Utc;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use super::context::BuildContext;
use super::executor;
use super::{PackageManager, ProvisioningStep, StepKind};
use crate::cancel::CancelSignal;
use crate::config::BuilderConfig;
use crate::error::BuildError;
use crate::fetch::Fetcher;
use crate::image::store::copy_tree;
use crate::image::{validate_tag, BaseImage, EnvironmentImage, ImageStore, Layer, Snapshot};
use crate::rebuild;
use crate::recipe::validate_all;
use crate::verify::{verify_rootfs, VerifySpec};
use crate::Timer;

/// Progress of a single build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Pending,
    /// Applying the step at this 0-based index.
    Applying(usize),
    Verifying,
    Complete,
    /// Terminal for this attempt; a new build starts again from `Pending`.
    Failed,
}

impl BuildState {
    /// Check if a transition to the given state is valid.
    pub fn can_transition_to(&self, next: BuildState) -> bool {
        use BuildState::*;
        match (*self, next) {
            (Pending, Applying(0)) => true,
            // Up-to-date image reused without applying anything.
            (Pending, Complete) => true,
            (Applying(i), Applying(j)) => j == i + 1,
            (Applying(_), Verifying) => true,
            (Verifying, Complete) => true,
            (Pending | Applying(_) | Verifying, Failed) => true,
            (Complete | Failed, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildState::Pending => f.write_str("pending"),
            BuildState::Applying(i) => write!(f, "applying step {}", i + 1),
            BuildState::Verifying => f.write_str("verifying"),
            BuildState::Complete => f.write_str("complete"),
            BuildState::Failed => f.write_str("failed"),
        }
    }
}

/// Everything needed to build one image.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub base: BaseImage,
    pub steps: Vec<ProvisioningStep>,
    pub package_manager: PackageManager,
    pub verify: VerifySpec,
    /// Tag pointed at the published image.
    pub tag: Option<String>,
    /// Rebuild even if the tag already points at an up-to-date image.
    pub force: bool,
}

impl BuildRequest {
    pub fn new(base: BaseImage, steps: Vec<ProvisioningStep>) -> Self {
        Self {
            base,
            steps,
            package_manager: PackageManager::default(),
            verify: VerifySpec::default(),
            tag: None,
            force: false,
        }
    }
}

/// Turns a base image and a step list into a published [`EnvironmentImage`].
pub struct EnvironmentBuilder {
    config: BuilderConfig,
    store: ImageStore,
    fetcher: Arc<dyn Fetcher>,
    cancel: CancelSignal,
    state: BuildState,
    history: Vec<BuildState>,
}

impl EnvironmentBuilder {
    pub fn new(
        config: BuilderConfig,
        store: ImageStore,
        fetcher: Arc<dyn Fetcher>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
            cancel,
            state: BuildState::Pending,
            history: vec![BuildState::Pending],
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    /// States visited by the most recent build, starting with `Pending`.
    pub fn history(&self) -> &[BuildState] {
        &self.history
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    fn transition(&mut self, next: BuildState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid build state transition: {} -> {}",
            self.state,
            next
        );
        tracing::debug!(from = %self.state, to = %next, "build state");
        self.state = next;
        self.history.push(next);
    }

    /// Build `request`. Either the returned image exists in the store in
    /// full, or nothing was published.
    pub async fn build(&mut self, request: &BuildRequest) -> Result<EnvironmentImage, BuildError> {
        if self.state != BuildState::Pending {
            self.transition(BuildState::Pending);
        }
        self.history = vec![BuildState::Pending];

        let result = self.run(request).await;
        match &result {
            Ok(image) => {
                tracing::info!(id = %image.id, digest = %image.digest, "build complete");
            }
            Err(e) => {
                tracing::error!(error = %e, "build failed");
                self.transition(BuildState::Failed);
            }
        }
        result
    }

    async fn run(&mut self, request: &BuildRequest) -> Result<EnvironmentImage, BuildError> {
        // Every payload is checked before anything runs or touches the network.
        validate_request(request, self.config.require_pinned_versions)?;

        let base_record = self
            .store
            .base_record(&request.base)
            .map_err(BuildError::store)?
            .ok_or_else(|| BuildError::BaseImageNotFound {
                reference: request.base.to_string(),
            })?;

        let input_digest = rebuild::input_digest(
            &base_record.digest,
            &request.steps,
            &request.package_manager,
            &request.verify,
        );

        if let (Some(tag), false) = (&request.tag, request.force) {
            if let Some(image) =
                rebuild::cached_image(&self.store, tag, &input_digest).map_err(BuildError::store)?
            {
                println!("[SKIP] {} is up to date ({})", tag, image.id);
                self.transition(BuildState::Complete);
                return Ok(image);
            }
        }

        println!("\n=== Building environment from {} ===\n", request.base);
        let build_timer = Timer::start("Build");

        let work = self.store.begin_work().map_err(BuildError::store)?;
        let rootfs = work.rootfs();
        prepare_rootfs(&self.store.base_rootfs(&request.base), &rootfs)
            .map_err(BuildError::store)?;

        let fetcher = Arc::clone(&self.fetcher);
        let cancel = self.cancel.clone();
        let ctx = BuildContext {
            rootfs: rootfs.clone(),
            isolation: self.config.isolation,
            package_manager: &request.package_manager,
            fetcher: fetcher.as_ref(),
            cancel: &cancel,
            default_timeout: self.config.step_timeout(),
            stream_output: self.config.stream_output,
        };

        let total = request.steps.len();
        let mut before = snapshot(&rootfs)?;
        let mut layers = Vec::with_capacity(total);

        for (index, step) in request.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(BuildError::Cancelled {
                    step: Some(step.step_ref()),
                });
            }
            self.transition(BuildState::Applying(index));
            println!("[{}/{}] {}: {}", index + 1, total, step.kind.label(), step.summary());
            tracing::debug!(step = %step.step_ref(), timeout = ?step.timeout(ctx.default_timeout), "applying step");

            let timer = Timer::start(step.kind.label());
            executor::execute(&ctx, step).await?;

            let after = snapshot(&rootfs)?;
            let layer = Layer::diff(index, step.kind.label(), &before, &after);
            println!(
                "    layer {}: +{} ~{} -{}",
                EnvironmentImage::short_id(&layer.digest),
                layer.added.len(),
                layer.modified.len(),
                layer.removed.len()
            );
            timer.finish();
            layers.push(layer);
            before = after;
        }

        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled { step: None });
        }

        self.transition(BuildState::Verifying);
        verify_rootfs(&rootfs, &request.verify)?;

        let digest = EnvironmentImage::content_digest(&base_record.digest, &layers);
        let image = EnvironmentImage {
            id: EnvironmentImage::short_id(&digest),
            digest,
            tag: request.tag.clone(),
            base: request.base.clone(),
            base_digest: base_record.digest.clone(),
            input_digest,
            steps: request.steps.clone(),
            layers: layers.iter().map(Layer::summary).collect(),
            built_at: Utc::now(),
        };

        let published = self
            .store
            .publish(work, &image, &layers)
            .map_err(BuildError::store)?;
        self.transition(BuildState::Complete);

        println!("\n=== Environment Build Complete ===\n");
        // The image is already published; a summary failure is not a build failure.
        if let Err(e) = print_summary(&image, &published.join("rootfs")) {
            tracing::warn!(error = %format!("{:#}", e), "failed to summarize image");
        }
        build_timer.finish();

        Ok(image)
    }
}

fn validate_request(request: &BuildRequest, require_pinned_versions: bool) -> Result<(), BuildError> {
    validate_all(&request.steps, require_pinned_versions)?;

    for (index, step) in request.steps.iter().enumerate() {
        if step.order != index {
            return Err(BuildError::MalformedStepSpec {
                step: step.step_ref(),
                reason: format!("declared at position {} but ordered {}", index + 1, step.order + 1),
            });
        }
    }

    if let Err(reason) = request.package_manager.validate() {
        if let Some(step) = request
            .steps
            .iter()
            .find(|s| matches!(s.kind, StepKind::PackageInstall { .. }))
        {
            return Err(BuildError::MalformedStepSpec {
                step: step.step_ref(),
                reason,
            });
        }
    }

    if let Some(tag) = &request.tag {
        validate_tag(tag).map_err(BuildError::store)?;
    }
    Ok(())
}

/// Seed the staging rootfs from the base. The base itself is only read.
fn prepare_rootfs(base_rootfs: &Path, rootfs: &Path) -> anyhow::Result<()> {
    println!("Preparing staging rootfs: {}", rootfs.display());
    copy_tree(base_rootfs, rootfs)
        .with_context(|| format!("Failed to copy base rootfs {}", base_rootfs.display()))
}

fn snapshot(rootfs: &Path) -> Result<Snapshot, BuildError> {
    Snapshot::capture(rootfs)
        .with_context(|| format!("Failed to snapshot {}", rootfs.display()))
        .map_err(BuildError::store)
}

/// Print a summary of the built image.
fn print_summary(image: &EnvironmentImage, rootfs: &Path) -> anyhow::Result<()> {
    let (files, dirs, symlinks) = count_items(rootfs)?;

    println!("Build Summary:");
    println!("  Image: {}", image.id);
    if let Some(tag) = &image.tag {
        println!("  Tag: {}", tag);
    }
    println!("  Base: {}", image.base);
    println!("  Digest: {}", image.digest);
    println!("  Files: {}", files);
    println!("  Directories: {}", dirs);
    println!("  Symlinks: {}", symlinks);

    let size = dir_size(rootfs)?;
    println!("  Total size: {:.1} MB", size as f64 / 1024.0 / 1024.0);

    println!("  Layers:");
    for layer in &image.layers {
        println!(
            "    {:>2}. {:<16} +{} ~{} -{}",
            layer.index + 1,
            layer.kind,
            layer.added,
            layer.modified,
            layer.removed
        );
    }

    Ok(())
}

/// Count files, directories, and symlinks in a path.
pub fn count_items(path: &Path) -> anyhow::Result<(usize, usize, usize)> {
    let mut files = 0;
    let mut dirs = 0;
    let mut symlinks = 0;

    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_symlink() {
                symlinks += 1;
            } else if path.is_dir() {
                dirs += 1;
                let (f, d, s) = count_items(&path)?;
                files += f;
                dirs += d;
                symlinks += s;
            } else {
                files += 1;
            }
        }
    }

    Ok((files, dirs, symlinks))
}

/// Calculate total size of a directory.
pub fn dir_size(path: &Path) -> anyhow::Result<u64> {
    let mut size = 0;

    if path.is_file() {
        return Ok(fs::metadata(path)?.len());
    }

    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let path = entry?.path();

            if path.is_symlink() {
                continue;
            } else if path.is_dir() {
                size += dir_size(&path)?;
            } else {
                size += fs::symlink_metadata(&path)?.len();
            }
        }
    }

    Ok(size)
}
