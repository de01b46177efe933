//! Per-build context handed to every step.

use std::path::PathBuf;
use std::time::Duration;

use crate::cancel::CancelSignal;
use crate::config::Isolation;
use crate::fetch::Fetcher;
use crate::process::Cmd;

use super::PackageManager;

/// `PATH` inside a chrooted image; the host's `PATH` may not exist there.
const IMAGE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Everything a step needs to act on the staging rootfs.
pub struct BuildContext<'a> {
    /// Staging rootfs (inside the build's work directory).
    pub rootfs: PathBuf,
    pub isolation: Isolation,
    pub package_manager: &'a PackageManager,
    pub fetcher: &'a dyn Fetcher,
    pub cancel: &'a CancelSignal,
    /// Applied when a step has no `timeout_secs` of its own.
    pub default_timeout: Duration,
    pub stream_output: bool,
}

impl<'a> BuildContext<'a> {
    /// Build a command that runs against the rootfs.
    ///
    /// Under chroot isolation the program is resolved inside the image. In
    /// host mode it runs on the host with the rootfs as working directory
    /// and in `ENVBUILD_ROOT`.
    pub fn command(&self, program: &str, args: &[String], timeout: Duration) -> Cmd {
        let cmd = match self.isolation {
            Isolation::Chroot => Cmd::new("chroot")
                .arg_path(&self.rootfs)
                .arg(program)
                .args(args)
                .env("PATH", IMAGE_PATH)
                .env("HOME", "/root"),
            Isolation::Host => Cmd::new(program)
                .args(args)
                .current_dir(&self.rootfs)
                .env("ENVBUILD_ROOT", self.rootfs.to_string_lossy()),
        };
        cmd.timeout(timeout).inherit_output(self.stream_output)
    }
}
