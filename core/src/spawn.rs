//! Process supervision for the executor and for direct commands.
//!
//! [`launch`] starts a child with piped stdout/stderr and hands back two
//! halves: a [`ProcessHandle`] that the owner keeps to request termination,
//! and a [`ProcessIo`] carrying the output streams plus the single completion
//! notification. A background supervisor task owns the [`Child`] itself and is
//! the only place that waits on or signals it.

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use tokio::process::Child;
use tokio::process::ChildStderr;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use crate::error::SpawnError;

/// How long a process gets to exit after the graceful signal before it is
/// force-killed.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one launched process. Never reused within a gateway run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub kill_grace: Duration,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    Signaled(i32),
    /// Ended because the owner asked for termination.
    Terminated,
}

impl ProcessExit {
    pub fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        #[cfg(unix)]
        {
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }
        Self::Exited(-1)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::Terminated => write!(f, "terminated on request"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TerminationRequest {
    None,
    Graceful,
    Force,
}

/// Owner-side handle of a running process.
///
/// Dropping the handle terminates the process: the supervisor task observes
/// the closed request channel and runs the same graceful shutdown as
/// [`ProcessHandle::terminate`].
#[derive(Debug)]
pub struct ProcessHandle {
    id: ProcessId,
    pid: Option<u32>,
    requests: watch::Sender<TerminationRequest>,
    finished: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Sends the graceful termination signal. Returns `false` when the
    /// process already finished or termination was already requested.
    pub fn terminate(&self) -> bool {
        self.request(TerminationRequest::Graceful)
    }

    /// Kills the process (and its process group on Unix) without a grace
    /// period.
    pub fn force_kill(&self) -> bool {
        self.request(TerminationRequest::Force)
    }

    fn request(&self, request: TerminationRequest) -> bool {
        if self.is_finished() {
            return false;
        }
        let escalated = self.requests.send_if_modified(|current| {
            if request > *current {
                *current = request;
                true
            } else {
                false
            }
        });
        if escalated {
            debug!(process_id = %self.id, ?request, "termination requested");
        }
        escalated
    }
}

/// Resolves exactly once with the process exit.
#[derive(Debug)]
pub struct ProcessCompletion {
    rx: oneshot::Receiver<ProcessExit>,
}

impl Future for ProcessCompletion {
    type Output = ProcessExit;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // The supervisor only drops the sender without reporting when the
        // runtime is shutting down underneath it.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(ProcessExit::Terminated))
    }
}

#[derive(Debug)]
pub struct ProcessIo {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub completion: ProcessCompletion,
}

/// Starts `spec` and returns the owner handle plus its I/O.
///
/// Must be called from within a Tokio runtime.
pub fn launch(spec: LaunchSpec) -> Result<(ProcessHandle, ProcessIo), SpawnError> {
    let LaunchSpec {
        program,
        args,
        cwd,
        env,
        kill_grace,
    } = spec;
    let program_name = program.display().to_string();

    if !cwd.is_dir() {
        return Err(SpawnError::WorkingDirectory { path: cwd });
    }

    let mut command = Command::new(&program);
    command
        .args(&args)
        .current_dir(&cwd)
        .envs(&env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Lead a fresh process group so termination reaches whatever the
    // executor spawned underneath it.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|err| SpawnError::io(program_name.clone(), err))?;

    // Both pipes were configured with `Stdio::piped()` above, so `take()`
    // only fails if something is badly wrong; the child is killed on drop.
    let stdout = child
        .stdout
        .take()
        .ok_or(SpawnError::MissingPipe("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(SpawnError::MissingPipe("stderr"))?;

    let id = ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::SeqCst));
    let pid = child.id();
    let (requests_tx, requests_rx) = watch::channel(TerminationRequest::None);
    let (exit_tx, exit_rx) = oneshot::channel();
    let finished = Arc::new(AtomicBool::new(false));

    tokio::spawn(supervise(
        child,
        id,
        pid,
        requests_rx,
        kill_grace,
        Arc::clone(&finished),
        exit_tx,
    ));
    debug!(process_id = %id, pid, program = %program_name, "process launched");

    Ok((
        ProcessHandle {
            id,
            pid,
            requests: requests_tx,
            finished,
        },
        ProcessIo {
            stdout,
            stderr,
            completion: ProcessCompletion { rx: exit_rx },
        },
    ))
}

async fn supervise(
    mut child: Child,
    id: ProcessId,
    pid: Option<u32>,
    mut requests: watch::Receiver<TerminationRequest>,
    grace: Duration,
    finished: Arc<AtomicBool>,
    exit_tx: oneshot::Sender<ProcessExit>,
) {
    let exit = loop {
        let request = *requests.borrow_and_update();
        match request {
            TerminationRequest::None => {}
            TerminationRequest::Graceful => break shutdown(&mut child, pid, grace).await,
            TerminationRequest::Force => break kill(&mut child, pid).await,
        }

        tokio::select! {
            biased;
            changed = requests.changed() => {
                if changed.is_err() {
                    debug!(process_id = %id, "process handle dropped; terminating");
                    break shutdown(&mut child, pid, grace).await;
                }
            }
            status = child.wait() => {
                break match status {
                    Ok(status) => ProcessExit::from(status),
                    Err(err) => {
                        warn!(process_id = %id, "failed to wait on child: {err}");
                        ProcessExit::Exited(-1)
                    }
                };
            }
        }
    };

    finished.store(true, Ordering::SeqCst);
    debug!(process_id = %id, %exit, "process finished");
    let _ = exit_tx.send(exit);
}

async fn shutdown(child: &mut Child, pid: Option<u32>, grace: Duration) -> ProcessExit {
    signal_process(child, pid, false);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => ProcessExit::Terminated,
        Err(_) => {
            debug!(pid, "grace period elapsed; force killing");
            kill(child, pid).await
        }
    }
}

async fn kill(child: &mut Child, pid: Option<u32>) -> ProcessExit {
    signal_process(child, pid, true);
    if let Err(err) = child.wait().await {
        warn!(pid, "failed to reap killed child: {err}");
    }
    ProcessExit::Terminated
}

#[cfg(unix)]
fn signal_process(child: &mut Child, pid: Option<u32>, force: bool) {
    let Some(pid) = pid else {
        return;
    };
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    // Negative pid addresses the whole group the child leads.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc != 0 {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn signal_process(child: &mut Child, _pid: Option<u32>, _force: bool) {
    let _ = child.start_kill();
}
