//! Step executor: interprets a [`StepKind`] against the staging rootfs.
//!
//! This is the single place where step effects are implemented. Every
//! failure is mapped to a [`BuildError`] naming the step; nothing is retried.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use tokio::time::Instant;

use super::context::BuildContext;
use super::{ProvisioningStep, StepKind, VerificationPolicy};
use crate::config::Isolation;
use crate::error::{BuildError, StepRef};
use crate::fetch::{self, Verified};
use crate::image::resolve_in_rootfs;
use crate::process::{Cmd, CmdError};

/// Apply one step, bounded by its timeout.
///
/// The timeout is a deadline shared by every command the step runs. Commands
/// are stopped through [`Cmd`] rather than by dropping their futures, so a
/// timed-out step has no processes left when this returns.
pub async fn execute(ctx: &BuildContext<'_>, step: &ProvisioningStep) -> Result<(), BuildError> {
    let budget = Budget::new(step.timeout(ctx.default_timeout));
    let step_ref = step.step_ref();
    match &step.kind {
        StepKind::PackageInstall { packages } => {
            install_packages(ctx, step_ref, packages, &budget).await
        }
        StepKind::RemoteScriptInstall {
            url,
            verify,
            args,
            interpreter,
        } => run_remote_script(ctx, step_ref, url, verify, args, interpreter, &budget).await,
        StepKind::Cleanup { paths, keep } => cleanup(ctx, step_ref, paths, keep),
    }
}

/// Time left to a step.
struct Budget {
    limit: Duration,
    deadline: Instant,
}

impl Budget {
    fn new(limit: Duration) -> Self {
        Self {
            limit,
            deadline: Instant::now() + limit,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn expired(&self, step: StepRef) -> BuildError {
        BuildError::StepExecutionFailure {
            step,
            reason: format!("timed out after {}s", self.limit.as_secs()),
        }
    }
}

// =========================================================================
// PACKAGE-INSTALL
// =========================================================================

async fn install_packages(
    ctx: &BuildContext<'_>,
    step: StepRef,
    packages: &BTreeSet<String>,
    budget: &Budget,
) -> Result<(), BuildError> {
    let pm = ctx.package_manager;

    if let Some((program, args)) = pm.update.split_first() {
        println!("    Updating package index...");
        let cmd = with_env(ctx.command(program, args, budget.remaining()), &pm.env)
            .error_msg("package index update failed");
        run(ctx, step, cmd, budget).await?;
    }

    let Some((program, base_args)) = pm.install.split_first() else {
        return Err(BuildError::MalformedStepSpec {
            step,
            reason: "package_manager.install is empty".into(),
        });
    };
    let mut args = base_args.to_vec();
    args.extend(packages.iter().cloned());

    println!("    Installing {} package(s)...", packages.len());
    let cmd = with_env(ctx.command(program, &args, budget.remaining()), &pm.env)
        .error_msg("package install failed");
    run(ctx, step, cmd, budget).await
}

fn with_env(cmd: Cmd, env: &std::collections::BTreeMap<String, String>) -> Cmd {
    env.iter().fold(cmd, |cmd, (k, v)| cmd.env(k, v))
}

// =========================================================================
// REMOTE-SCRIPT
// =========================================================================

async fn run_remote_script(
    ctx: &BuildContext<'_>,
    step: StepRef,
    url: &str,
    policy: &VerificationPolicy,
    args: &[String],
    interpreter: &str,
    budget: &Budget,
) -> Result<(), BuildError> {
    let network = |reason: String| BuildError::NetworkFailure {
        step,
        url: url.to_string(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|e| network(e.to_string()))?;

    println!("    Fetching {}...", url);
    let content = tokio::select! {
        result = tokio::time::timeout_at(budget.deadline, ctx.fetcher.fetch(&parsed)) => match result {
            Ok(fetched) => fetched.map_err(|e| network(e.to_string()))?,
            Err(_) => return Err(budget.expired(step)),
        },
        _ = ctx.cancel.cancelled() => return Err(BuildError::Cancelled { step: Some(step) }),
    };

    match fetch::verify(policy, &content) {
        Ok(Verified::Matched(digest)) => {
            println!("    [OK] sha256 {}", digest);
        }
        Ok(Verified::Skipped(digest)) => {
            println!("    [WARN] integrity check skipped (insecure-skip), sha256 {}", digest);
            tracing::warn!(%step, %url, sha256 = %digest, "executing unverified remote script");
        }
        Err(mismatch) => {
            return Err(BuildError::IntegrityViolation {
                step,
                expected: mismatch.expected,
                actual: mismatch.actual,
            });
        }
    }

    let image_path = format!("/tmp/.envbuild-step-{}.sh", step.order + 1);
    let host_path = stage_script(&ctx.rootfs, &image_path, &content).map_err(|e| {
        BuildError::StepExecutionFailure {
            step,
            reason: format!("failed to stage script at {}: {}", image_path, e),
        }
    })?;

    let exec_path = match ctx.isolation {
        Isolation::Chroot => image_path.clone(),
        Isolation::Host => host_path.to_string_lossy().into_owned(),
    };
    let mut argv = vec![exec_path];
    argv.extend(args.iter().cloned());

    println!("    Running installer...");
    let cmd = ctx
        .command(interpreter, &argv, budget.remaining())
        .error_msg("remote installer failed");
    let result = run(ctx, step, cmd, budget).await;

    if let Err(e) = fs::remove_file(&host_path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %host_path.display(), error = %e, "failed to remove staged script");
        }
    }
    result
}

/// Write an installer into the image's `/tmp` and return its host path.
///
/// `/tmp` is resolved inside the image, so a symlinked `/tmp` cannot send
/// the script onto the host. A missing `/tmp` is created.
fn stage_script(rootfs: &Path, image_path: &str, content: &[u8]) -> io::Result<PathBuf> {
    let (dir, name) = image_path.rsplit_once('/').unwrap_or(("/", image_path));
    let tmp = match resolve_in_rootfs(rootfs, dir) {
        Some(tmp) => tmp,
        None if fs::symlink_metadata(rootfs.join(dir.trim_start_matches('/'))).is_err() => {
            let tmp = rootfs.join(dir.trim_start_matches('/'));
            fs::create_dir_all(&tmp)?;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o1777))?;
            tmp
        }
        None => {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not resolve inside the image", dir),
            ))
        }
    };
    if !fs::symlink_metadata(&tmp)?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory in the image", dir),
        ));
    }

    let path = tmp.join(name);
    // A leftover entry (possibly a planted symlink) is replaced, never followed.
    match fs::remove_file(&path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o700)
        .open(&path)?;
    file.write_all(content)?;
    Ok(path)
}

// =========================================================================
// CLEANUP
// =========================================================================

fn cleanup(
    ctx: &BuildContext<'_>,
    step: StepRef,
    paths: &BTreeSet<String>,
    keep: &BTreeSet<String>,
) -> Result<(), BuildError> {
    let mut removed = 0;
    for path in paths {
        removed += clean_path(&ctx.rootfs, path, keep).map_err(|e| {
            BuildError::StepExecutionFailure {
                step,
                reason: format!("failed to clean {}: {}", path, e),
            }
        })?;
    }
    println!("    Removed {} entr{}", removed, if removed == 1 { "y" } else { "ies" });
    Ok(())
}

/// Empty a directory (keeping it and any `keep` names) or remove a file.
/// Missing paths count as already clean.
fn clean_path(rootfs: &Path, image_path: &str, keep: &BTreeSet<String>) -> io::Result<usize> {
    let (parent, name) = match image_path.trim_end_matches('/').rsplit_once('/') {
        Some((parent, name)) => (if parent.is_empty() { "/" } else { parent }, name),
        None => return Ok(0),
    };
    // Parents are resolved inside the image; the last component is not
    // followed, so a symlink is removed rather than its target.
    let Some(parent) = resolve_in_rootfs(rootfs, parent) else {
        tracing::debug!(path = image_path, "cleanup path missing");
        return Ok(0);
    };
    let target = parent.join(name);

    let meta = match fs::symlink_metadata(&target) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    if !meta.is_dir() {
        fs::remove_file(&target)?;
        return Ok(1);
    }

    let mut removed = 0;
    for entry in fs::read_dir(&target)? {
        let entry = entry?;
        if keep.contains(entry.file_name().to_string_lossy().as_ref()) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// Run a command, translating its failure into a step error.
async fn run(
    ctx: &BuildContext<'_>,
    step: StepRef,
    cmd: Cmd,
    budget: &Budget,
) -> Result<(), BuildError> {
    tracing::debug!(%step, command = %cmd.display(), "step command");
    cmd.run(ctx.cancel)
        .await
        .map(|_| ())
        .map_err(|err| command_error(step, err, budget))
}

fn command_error(step: StepRef, err: CmdError, budget: &Budget) -> BuildError {
    match err {
        CmdError::Cancelled { .. } => BuildError::Cancelled { step: Some(step) },
        CmdError::TimedOut { .. } => budget.expired(step),
        other => BuildError::StepExecutionFailure {
            step,
            reason: other.to_string(),
        },
    }
}
