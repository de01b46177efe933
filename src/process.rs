//! External command runner.
//!
//! Every command the builder launches goes through [`Cmd`]: stdin is closed so
//! nothing can prompt, a timeout bounds the wait, and the child's whole
//! process group is killed if the operator cancels.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;

use crate::cancel::CancelSignal;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit code, `None` if killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Error, Debug)]
pub enum CmdError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", .after.as_secs())]
    TimedOut { program: String, after: Duration },

    #[error("{program} cancelled")]
    Cancelled { program: String },

    #[error("{message}: {program} exited with {}{}", describe_code(.code), stderr_suffix(.stderr))]
    Failed {
        program: String,
        message: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let tail = stderr_tail(stderr, 10);
    if tail.is_empty() {
        String::new()
    } else {
        format!("\n  {}", tail.replace('\n', "\n  "))
    }
}

/// Last `lines` non-empty lines of a command's stderr.
pub fn stderr_tail(stderr: &str, lines: usize) -> String {
    let kept: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = kept.len().saturating_sub(lines);
    kept[start..].join("\n")
}

/// Builder for an external command.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    timeout: Option<Duration>,
    allow_fail: bool,
    inherit_output: bool,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            timeout: None,
            allow_fail: false,
            inherit_output: false,
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_owned());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Return non-zero exits as a [`CommandResult`] instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Stream the child's stdout/stderr to ours instead of capturing them.
    pub fn inherit_output(mut self, inherit: bool) -> Self {
        self.inherit_output = inherit;
        self
    }

    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Command line for log output.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Run to completion, racing the timeout and the cancel signal.
    ///
    /// The command leads its own process group. Whatever the outcome, the
    /// group is killed once the leader is done, so nothing the command forked
    /// keeps running after this returns.
    pub async fn run(self, cancel: &CancelSignal) -> Result<CommandResult, CmdError> {
        tracing::debug!(command = %self.display(), "running");

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        if self.inherit_output {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|source| CmdError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let mut group = ProcessGroup::of(&child);
        let stdout = child.stdout.take().map(|out| tokio::spawn(read_all(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_all(err)));

        let waited = {
            let limit = self.timeout;
            let wait = child.wait();
            let bounded = async move {
                match limit {
                    Some(after) => tokio::time::timeout(after, wait)
                        .await
                        .map_err(|_| Stop::TimedOut(after)),
                    None => Ok(wait.await),
                }
            };
            tokio::select! {
                result = bounded => result,
                _ = cancel.cancelled() => Err(Stop::Cancelled),
            }
        };

        group.kill();
        let status = match waited {
            Ok(status) => status.map_err(|source| CmdError::Spawn {
                program: self.program.clone(),
                source,
            })?,
            Err(stop) => {
                // Reap the leader before the caller touches its rootfs again.
                let _ = child.wait().await;
                return Err(match stop {
                    Stop::TimedOut(after) => CmdError::TimedOut {
                        program: self.program,
                        after,
                    },
                    Stop::Cancelled => CmdError::Cancelled {
                        program: self.program,
                    },
                });
            }
        };

        let result = CommandResult {
            code: status.code(),
            stdout: collect(stdout).await,
            stderr: collect(stderr).await,
        };

        if !result.success() && !self.allow_fail {
            return Err(CmdError::Failed {
                message: self
                    .error_msg
                    .unwrap_or_else(|| "command failed".to_string()),
                program: self.program,
                code: result.code,
                stderr: result.stderr,
            });
        }

        Ok(result)
    }
}

enum Stop {
    TimedOut(Duration),
    Cancelled,
}

/// Process group led by a spawned command. Killed on drop if still armed.
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self(child.id().map(|id| Pid::from_raw(id as i32)))
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            // ESRCH: every member already exited.
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                if e != Errno::ESRCH {
                    tracing::warn!(pgid = pgid.as_raw(), error = %e, "failed to kill process group");
                }
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn read_all(mut pipe: impl AsyncRead + Unpin) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    buf
}

async fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    match reader {
        Some(handle) => String::from_utf8_lossy(&handle.await.unwrap_or_default()).into_owned(),
        None => String::new(),
    }
}

/// Locate an executable on `PATH`.
pub fn which(tool: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|candidate| {
            candidate
                .metadata()
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

pub fn exists(tool: &str) -> bool {
    which(tool).is_some()
}
