//! Isolated, resource-bounded command execution for builds
//!
//! Every deployment gets its own directory with `src/`, `home/` and `tmp/`.
//! Commands run in their own process group with a cleared environment, so a
//! timeout or cancellation can take down everything they spawned.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::deploy::logstream::{LogSource, LogStream};
use crate::errors::ShipyardError;
use crate::filesys::dir::Dir;
use crate::models::deployment::BuildStep;
use crate::storage::settings::SandboxSettings;

/// Lines longer than this are truncated
const MAX_LINE_LENGTH: usize = 16 * 1024;
const LOG_CHANNEL_CAPACITY: usize = 1000;
/// Time between SIGTERM and SIGKILL
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Why a sandboxed command did not succeed
#[derive(Error, Debug)]
pub enum StepError {
    #[error("failed to start: {0}")]
    Spawn(String),

    #[error("exited with status {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Exit { code: Option<i32> },

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

/// Limits and isolation applied to every command
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    pub cpu_seconds: Option<u64>,
    pub memory_kib: Option<u64>,
    pub wrapper: Vec<String>,
    pub pass_env: Vec<String>,
    /// Extra variables set for every command
    pub env: Vec<(String, String)>,
}

impl From<&SandboxSettings> for SandboxOptions {
    fn from(settings: &SandboxSettings) -> Self {
        Self {
            cpu_seconds: settings.cpu_seconds,
            memory_kib: settings.memory_kib,
            wrapper: settings.wrapper.clone(),
            pass_env: settings.pass_env.clone(),
            env: Vec::new(),
        }
    }
}

/// A per-deployment build sandbox
pub struct Sandbox {
    root: Dir,
    options: SandboxOptions,
}

impl Sandbox {
    /// Create a fresh sandbox for a deployment, replacing any leftovers
    pub async fn create(
        workspaces: &Dir,
        deployment_id: &str,
        options: SandboxOptions,
    ) -> Result<Self, ShipyardError> {
        let root = workspaces.subdir(deployment_id);
        root.delete().await?;
        for name in ["src", "home", "tmp"] {
            root.subdir(name).create().await?;
        }
        Ok(Self { root, options })
    }

    pub fn root(&self) -> &Dir {
        &self.root
    }

    /// Working directory holding the fetched revision
    pub fn source_dir(&self) -> Dir {
        self.root.subdir("src")
    }

    /// Remove the sandbox and everything in it
    pub async fn destroy(&self) -> Result<(), ShipyardError> {
        self.root.delete().await
    }

    /// Run a shell command line in the source directory
    pub async fn run_shell(
        &self,
        command: &str,
        step: BuildStep,
        timeout: Duration,
        log: &LogStream,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let argv = vec!["bash".to_string(), "-c".to_string(), command.to_string()];
        self.run(argv, self.source_dir().path(), step, timeout, log, cancel)
            .await
    }

    /// Run `argv` in `cwd`, streaming its output to `log` in order
    pub async fn run(
        &self,
        argv: Vec<String>,
        cwd: &Path,
        step: BuildStep,
        timeout: Duration,
        log: &LogStream,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let argv = self.command_line(argv);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| StepError::Spawn("empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear()
            .envs(self.environment());

        debug!(step = %step, "Spawning {:?} in {}", argv, cwd.display());
        let mut child = cmd
            .group_spawn()
            .map_err(|e| StepError::Spawn(format!("{}: {}", program, e)))?;
        let mut guard = GroupGuard::new(child.inner().id());

        let (tx, mut rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        if let Some(stdout) = child.inner().stdout.take() {
            tokio::spawn(pump_lines(stdout, LogSource::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.inner().stderr.take() {
            tokio::spawn(pump_lines(stderr, LogSource::Stderr, tx.clone()));
        }
        drop(tx);

        let forward = async {
            while let Some((source, line)) = rx.recv().await {
                log.write(source, Some(step), line).await;
            }
        };
        let supervise = async {
            let reason = tokio::select! {
                status = child.wait() => ExitReason::Completed(status),
                _ = tokio::time::sleep(timeout) => ExitReason::Timeout,
                _ = cancel.cancelled() => ExitReason::Cancelled,
            };
            match reason {
                ExitReason::Completed(_) => {
                    // background processes would keep the pipes open
                    guard.kill();
                }
                _ => terminate_group(&mut child, &mut guard).await,
            }
            reason
        };
        let (reason, ()) = tokio::join!(supervise, forward);

        match reason {
            ExitReason::Completed(Ok(status)) if status.success() => Ok(()),
            ExitReason::Completed(Ok(status)) => Err(StepError::Exit {
                code: status.code(),
            }),
            ExitReason::Completed(Err(e)) => Err(StepError::Spawn(format!("wait failed: {}", e))),
            ExitReason::Timeout => Err(StepError::TimedOut(timeout)),
            ExitReason::Cancelled => Err(StepError::Cancelled),
        }
    }

    /// Wrap `argv` with the resource limits and the namespace wrapper
    fn command_line(&self, argv: Vec<String>) -> Vec<String> {
        let mut limits = Vec::new();
        if let Some(cpu) = self.options.cpu_seconds {
            limits.push(format!("ulimit -t {}", cpu));
        }
        if let Some(mem) = self.options.memory_kib {
            limits.push(format!("ulimit -v {}", mem));
        }

        let limited = if limits.is_empty() {
            argv
        } else {
            let script = format!("{}; exec \"$0\" \"$@\"", limits.join("; "));
            let mut wrapped = vec!["bash".to_string(), "-c".to_string(), script];
            wrapped.extend(argv);
            wrapped
        };

        self.options
            .wrapper
            .iter()
            .cloned()
            .chain(limited)
            .collect()
    }

    fn environment(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (
                "PATH".to_string(),
                std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
            ),
            ("HOME".to_string(), self.root.subdir("home").path().display().to_string()),
            ("TMPDIR".to_string(), self.root.subdir("tmp").path().display().to_string()),
            ("CI".to_string(), "true".to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ];
        for name in &self.options.pass_env {
            if let Ok(value) = std::env::var(name) {
                env.push((name.clone(), value));
            }
        }
        env.extend(self.options.env.iter().cloned());
        env
    }
}

enum ExitReason {
    Completed(std::io::Result<ExitStatus>),
    Timeout,
    Cancelled,
}

async fn pump_lines<R>(reader: R, source: LogSource, tx: mpsc::Sender<(LogSource, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let mut line = String::from_utf8_lossy(&buf).trim_end_matches(['\n', '\r']).to_string();
                if line.len() > MAX_LINE_LENGTH {
                    let mut cut = MAX_LINE_LENGTH;
                    while !line.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    line.truncate(cut);
                    line.push_str("... [truncated]");
                }
                if tx.send((source, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Error reading command output: {}", e);
                break;
            }
        }
    }
}

/// Kills the process group when dropped, so an abandoned build future
/// never leaves processes behind
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn signal(&self, terminate: bool) {
        if let Some(pgid) = self.pgid {
            signal_group(pgid, terminate);
        }
    }

    fn kill(&mut self) {
        self.signal(false);
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.signal(false);
    }
}

async fn terminate_group(child: &mut AsyncGroupChild, guard: &mut GroupGuard) {
    guard.signal(true);

    let deadline = tokio::time::Instant::now() + TERMINATE_GRACE;
    while tokio::time::Instant::now() < deadline {
        if child.inner().try_wait().ok().flatten().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    guard.kill();
    let _ = child.wait().await;
}

#[cfg(unix)]
fn signal_group(pgid: u32, terminate: bool) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = if terminate { Signal::SIGTERM } else { Signal::SIGKILL };
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, "Unable to signal process group: {}", e),
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _terminate: bool) {}
