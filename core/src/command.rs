//! Direct command channel: raw shell commands with a wall-clock timeout.
//!
//! Output is forwarded verbatim as it arrives, tagged with the stream it came
//! from. Nothing here goes through the line classifier.

use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use stingbot_protocol::COMMAND_TIMEOUT_EXIT_CODE;
use stingbot_protocol::CommandCompleteEvent;
use stingbot_protocol::CommandOutputEvent;
use stingbot_protocol::ServerEvent;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::classifier::READ_CHUNK_SIZE;
use crate::config::CommandConfig;
use crate::error::CommandError;
use crate::error::SpawnError;
use crate::error::TimeoutExceeded;
use crate::error::ValidationError;
use crate::output::CappedOutput;
use crate::output::EventSink;
use crate::spawn;
use crate::spawn::LaunchSpec;
use crate::spawn::ProcessExit;

/// Exit code reported when the command could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;

const EXIT_CODE_SIGNAL_BASE: i32 = 128;

/// Time allowed for the pipes to reach EOF once the shell is gone.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: String,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandChunk {
    pub stream: CommandStream,
    pub data: Vec<u8>,
}

impl CommandChunk {
    pub fn into_event(self) -> ServerEvent {
        ServerEvent::CommandOutput(CommandOutputEvent {
            chunk: String::from_utf8_lossy(&self.data).into_owned(),
            is_error: self.stream == CommandStream::Stderr,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandExit {
    Exited(i32),
    Signaled(i32),
    TimedOut(TimeoutExceeded),
    /// The owning connection went away.
    Cancelled,
}

impl From<ProcessExit> for CommandExit {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Exited(code) => Self::Exited(code),
            ProcessExit::Signaled(signal) => Self::Signaled(signal),
            ProcessExit::Terminated => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCompletion {
    pub exit: CommandExit,
    /// Both streams, in arrival order.
    pub output: String,
    pub duration: Duration,
}

impl CommandCompletion {
    pub fn exit_code(&self) -> i32 {
        match self.exit {
            CommandExit::Exited(code) => code,
            CommandExit::Signaled(signal) => EXIT_CODE_SIGNAL_BASE + signal,
            CommandExit::TimedOut(_) => COMMAND_TIMEOUT_EXIT_CODE,
            CommandExit::Cancelled => SPAWN_FAILURE_EXIT_CODE,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.exit, CommandExit::TimedOut(_))
    }

    pub fn into_event(self) -> ServerEvent {
        let code = self.exit_code();
        let error = match self.exit {
            CommandExit::TimedOut(timeout) => Some(timeout.to_string()),
            _ => None,
        };
        ServerEvent::CommandComplete(CommandCompleteEvent {
            code,
            timed_out: self.timed_out(),
            output: self.output,
            error,
        })
    }
}

fn spawn_failure_event(err: &SpawnError) -> ServerEvent {
    ServerEvent::CommandComplete(CommandCompleteEvent {
        code: SPAWN_FAILURE_EXIT_CODE,
        output: String::new(),
        timed_out: false,
        error: Some(err.to_string()),
    })
}

/// Runs `request` through the configured shell.
///
/// Every chunk is sent on `chunks` before the completion is returned. When
/// `cancel` fires the process group is killed and the exit is
/// [`CommandExit::Cancelled`].
pub async fn run_command(
    request: CommandRequest,
    config: &CommandConfig,
    retention_bytes: usize,
    chunks: async_channel::Sender<CommandChunk>,
    cancel: CancellationToken,
) -> Result<CommandCompletion, CommandError> {
    if request.command.trim().is_empty() {
        return Err(ValidationError::EmptyCommand.into());
    }
    let Some((shell, shell_args)) = config.shell.split_first() else {
        return Err(SpawnError::NotFound {
            program: String::new(),
        }
        .into());
    };

    let spec = LaunchSpec::new(shell, &request.cwd)
        .args(shell_args.iter().cloned())
        .arg(request.command.as_str());
    let started = Instant::now();
    let (handle, io) = spawn::launch(spec)?;
    let process_id = handle.id();
    debug!(%process_id, cwd = %request.cwd.display(), "command spawned");

    let (agg_tx, agg_rx) = async_channel::unbounded::<CommandChunk>();
    let stdout_task = tokio::spawn(read_stream(io.stdout, CommandStream::Stdout, agg_tx.clone()));
    let stderr_task = tokio::spawn(read_stream(io.stderr, CommandStream::Stderr, agg_tx));
    let forward_task = tokio::spawn(forward_chunks(agg_rx, chunks, retention_bytes));

    let mut completion = io.completion;
    let timeout = config.timeout();
    let exit = tokio::select! {
        exit = &mut completion => CommandExit::from(exit),
        _ = tokio::time::sleep(timeout) => {
            warn!(%process_id, ?timeout, "command timed out; killing");
            handle.force_kill();
            completion.await;
            CommandExit::TimedOut(TimeoutExceeded { timeout })
        }
        _ = cancel.cancelled() => {
            debug!(%process_id, "command cancelled; killing");
            handle.force_kill();
            completion.await;
            CommandExit::Cancelled
        }
    };

    drain(stdout_task).await;
    drain(stderr_task).await;
    let output = match forward_task.await {
        Ok(output) => output.to_string_lossy(),
        Err(err) => {
            warn!(%process_id, "command output forwarder failed: {err}");
            String::new()
        }
    };

    Ok(CommandCompletion {
        exit,
        output,
        duration: started.elapsed(),
    })
}

/// Runs `request` and reports it on `sink` as `command.output` chunks
/// followed by one `command.complete`. Cancelled commands report nothing.
pub async fn relay_command(
    request: CommandRequest,
    config: &CommandConfig,
    retention_bytes: usize,
    sink: EventSink,
    cancel: CancellationToken,
) {
    let (chunk_tx, chunk_rx) = async_channel::unbounded::<CommandChunk>();
    let relay = {
        let sink = sink.clone();
        tokio::spawn(async move {
            while let Ok(chunk) = chunk_rx.recv().await {
                sink.send(chunk.into_event()).await;
            }
        })
    };

    let result = run_command(request, config, retention_bytes, chunk_tx, cancel).await;
    // All chunks precede the completion.
    if let Err(err) = relay.await {
        warn!("command chunk relay failed: {err}");
    }

    match result {
        Ok(completion) if completion.exit == CommandExit::Cancelled => {
            debug!("command cancelled; completion dropped");
        }
        Ok(completion) => {
            info!(
                code = completion.exit_code(),
                timed_out = completion.timed_out(),
                duration_ms = completion.duration.as_millis() as u64,
                "direct command finished"
            );
            sink.send(completion.into_event()).await;
        }
        Err(CommandError::Spawn(err)) => {
            warn!("direct command failed to spawn: {err}");
            sink.send(spawn_failure_event(&err)).await;
        }
        Err(err) => {
            sink.send(ServerEvent::error(err.to_string())).await;
        }
    }
}

async fn read_stream<R>(
    mut reader: R,
    stream: CommandStream,
    tx: async_channel::Sender<CommandChunk>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = CommandChunk {
                    stream,
                    data: buf[..n].to_vec(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(?stream, "failed to read command output: {err}");
                break;
            }
        }
    }
}

async fn forward_chunks(
    rx: async_channel::Receiver<CommandChunk>,
    chunks: async_channel::Sender<CommandChunk>,
    retention_bytes: usize,
) -> CappedOutput {
    let mut combined = CappedOutput::new(retention_bytes);
    while let Ok(chunk) = rx.recv().await {
        combined.push(&chunk.data);
        let _ = chunks.send(chunk).await;
    }
    combined
}

async fn drain(mut task: JoinHandle<()>) {
    if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut task)
        .await
        .is_err()
    {
        debug!("command pipe still open after exit; abandoning reader");
        task.abort();
    }
}
