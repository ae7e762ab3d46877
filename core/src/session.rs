//! Per-connection mission bridge.
//!
//! A [`MissionSession`] owns at most one executor process at a time. Starting
//! a mission launches the executor, relays its classified stdout and raw
//! stderr to the connection's [`EventSink`], and reports exactly one
//! `mission.complete` per accepted mission. A second `mission.start` while a
//! process is still alive is rejected with
//! [`SessionError::MissionAlreadyActive`].
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`. Completion notifications carry the [`ProcessId`] they belong to
//! and are ignored unless that process is still the active one.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use futures::StreamExt;
use stingbot_protocol::CommandExecuteParams;
use stingbot_protocol::MissionCompleteEvent;
use stingbot_protocol::NeuralCompleteEvent;
use stingbot_protocol::ServerEvent;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::ReadBuf;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::classifier::ClassifiedEvent;
use crate::classifier::MarkerSet;
use crate::classifier::READ_CHUNK_SIZE;
use crate::classifier::classify_stream;
use crate::command;
use crate::command::CommandRequest;
use crate::config::BridgeConfig;
use crate::error::CommandError;
use crate::error::ProcessFailure;
use crate::error::SessionError;
use crate::error::ValidationError;
use crate::output::CappedOutput;
use crate::output::EventSink;
use crate::spawn;
use crate::spawn::ProcessExit;
use crate::spawn::ProcessHandle;
use crate::spawn::ProcessId;
use crate::spawn::ProcessIo;

pub const ENGINE_STARTING: &str = "engine starting";
pub const MISSION_TERMINATED: &str = "mission terminated by operator";
pub const MISSION_ABORTED: &str = "mission aborted by operator";

/// Pipes can outlive the executor when it leaves background children behind;
/// stop waiting for EOF this long after the process itself is gone.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MissionId(pub u64);

impl fmt::Display for MissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mission-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionState {
    Idle,
    Launching,
    Running,
    Completed,
    Failed,
    Aborted,
}

/// Terminal result of one mission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissionOutcome {
    Completed { result: String },
    Failed { error: String },
    Aborted,
}

impl MissionOutcome {
    fn state(&self) -> MissionState {
        match self {
            Self::Completed { .. } => MissionState::Completed,
            Self::Failed { .. } => MissionState::Failed,
            Self::Aborted => MissionState::Aborted,
        }
    }

    pub fn to_event(&self) -> ServerEvent {
        let event = match self {
            Self::Completed { result } => MissionCompleteEvent {
                success: true,
                result: Some(result.clone()),
                ..Default::default()
            },
            Self::Failed { error } => MissionCompleteEvent {
                success: false,
                error: Some(error.clone()),
                ..Default::default()
            },
            Self::Aborted => MissionCompleteEvent {
                success: false,
                error: Some(MISSION_ABORTED.to_string()),
                aborted: true,
                result: None,
            },
        };
        ServerEvent::MissionComplete(event)
    }
}

/// Output gathered for the final `mission.complete`.
#[derive(Debug)]
struct MissionOutput {
    stdout: CappedOutput,
    stderr: CappedOutput,
    result: Option<String>,
}

type SharedOutput = Arc<StdMutex<MissionOutput>>;

impl MissionOutput {
    fn shared(retention_bytes: usize) -> SharedOutput {
        Arc::new(StdMutex::new(Self {
            stdout: CappedOutput::new(retention_bytes),
            stderr: CappedOutput::new(retention_bytes),
            result: None,
        }))
    }
}

fn lock_output(output: &SharedOutput) -> MutexGuard<'_, MissionOutput> {
    output
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug)]
struct ActiveMission {
    id: MissionId,
    /// `None` while launching.
    process: Option<ProcessHandle>,
    output: SharedOutput,
    aborted: bool,
}

impl ActiveMission {
    fn process_id(&self) -> Option<ProcessId> {
        self.process.as_ref().map(ProcessHandle::id)
    }
}

#[derive(Debug)]
struct SessionInner {
    state: MissionState,
    next_mission_id: u64,
    active: Option<ActiveMission>,
    last_outcome: Option<MissionOutcome>,
    closed: bool,
}

impl SessionInner {
    fn transition(&mut self, connection_id: ConnectionId, next: MissionState) {
        debug!(%connection_id, from = ?self.state, to = ?next, "mission state transition");
        self.state = next;
    }
}

pub struct MissionSession {
    connection_id: ConnectionId,
    created_at: DateTime<Utc>,
    config: Arc<BridgeConfig>,
    sink: EventSink,
    /// Parent of every direct-command job started on this connection.
    jobs: CancellationToken,
    /// Held from a lifecycle decision until its status event is queued, so
    /// launch, abort, and completion updates reach the client in state order.
    announce: AsyncMutex<()>,
    inner: StdMutex<SessionInner>,
    weak_self: Weak<MissionSession>,
}

impl fmt::Debug for MissionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MissionSession")
            .field("connection_id", &self.connection_id)
            .field("created_at", &self.created_at)
            .field("state", &self.state())
            .finish()
    }
}

impl MissionSession {
    pub fn new(
        connection_id: ConnectionId,
        config: Arc<BridgeConfig>,
        sink: EventSink,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            connection_id,
            created_at: Utc::now(),
            config,
            sink,
            jobs: CancellationToken::new(),
            announce: AsyncMutex::new(()),
            inner: StdMutex::new(SessionInner {
                state: MissionState::Idle,
                next_mission_id: 0,
                active: None,
                last_outcome: None,
                closed: false,
            }),
            weak_self: weak_self.clone(),
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> MissionState {
        self.lock().state
    }

    pub fn has_active_mission(&self) -> bool {
        self.lock().active.is_some()
    }

    pub fn last_outcome(&self) -> Option<MissionOutcome> {
        self.lock().last_outcome.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Pushes an out-of-band event (e.g. a rejected request) to the client.
    pub async fn notify(&self, event: ServerEvent) -> bool {
        self.sink.send(event).await
    }

    /// Starts a mission for `objective`.
    ///
    /// Returns an error without side effects when the objective is blank or a
    /// mission is already active. Otherwise the mission is accepted and will
    /// produce exactly one `mission.complete`; a spawn failure is reported
    /// that way too, before this returns.
    pub async fn start_mission(&self, objective: &str) -> Result<MissionId, SessionError> {
        let objective = objective.trim();
        if objective.is_empty() {
            return Err(ValidationError::EmptyObjective.into());
        }

        let (mission_id, output) = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(SessionError::SessionClosed);
            }
            if inner.active.is_some() {
                return Err(SessionError::MissionAlreadyActive);
            }
            inner.next_mission_id += 1;
            let mission_id = MissionId(inner.next_mission_id);
            let output = MissionOutput::shared(self.config.executor.max_output_bytes);
            inner.active = Some(ActiveMission {
                id: mission_id,
                process: None,
                output: Arc::clone(&output),
                aborted: false,
            });
            inner.transition(self.connection_id, MissionState::Launching);
            (mission_id, output)
        };
        info!(connection_id = %self.connection_id, %mission_id, objective, "mission accepted");

        let spec = self.config.executor.launch_spec(objective);
        let (handle, io) = match spawn::launch(spec) {
            Ok(launched) => launched,
            Err(err) => {
                warn!(connection_id = %self.connection_id, %mission_id, "executor spawn failed: {err}");
                self.conclude_launch_failure(mission_id, err.to_string())
                    .await;
                return Ok(mission_id);
            }
        };

        let process_id = handle.id();
        let pid = handle.pid();
        let announce = self.announce.lock().await;
        let aborted = {
            let mut inner = self.lock();
            let Some(active) = inner.active.as_mut().filter(|active| active.id == mission_id)
            else {
                // Closed while launching; dropping the handle terminates it.
                return Err(SessionError::SessionClosed);
            };
            let aborted = active.aborted;
            if aborted {
                handle.terminate();
            }
            active.process = Some(handle);
            if !aborted {
                inner.transition(self.connection_id, MissionState::Running);
            }
            aborted
        };
        info!(connection_id = %self.connection_id, %mission_id, %process_id, pid, "executor running");

        // Emitted before the pumps exist so it always precedes process output.
        // An abort that landed during launch has already reported termination.
        if !aborted {
            self.sink.send(ServerEvent::update(ENGINE_STARTING)).await;
        }
        drop(announce);

        tokio::spawn(drive_mission(
            self.weak_self.clone(),
            self.sink.clone(),
            Arc::clone(&self.config),
            mission_id,
            process_id,
            io,
            output,
        ));
        Ok(mission_id)
    }

    /// Requests termination of the running mission.
    ///
    /// The status update is emitted right away; the terminal
    /// `mission.complete` follows once the process is actually gone.
    pub async fn abort(&self) -> Result<MissionId, SessionError> {
        let _announce = self.announce.lock().await;
        let mission_id = {
            let mut inner = self.lock();
            let connection_id = self.connection_id;
            let Some(active) = inner.active.as_mut() else {
                return Err(SessionError::NoActiveMission);
            };
            if active.aborted {
                debug!(%connection_id, mission_id = %active.id, "abort already requested");
                return Ok(active.id);
            }
            active.aborted = true;
            if let Some(process) = &active.process {
                process.terminate();
            }
            let mission_id = active.id;
            inner.transition(connection_id, MissionState::Aborted);
            mission_id
        };
        info!(connection_id = %self.connection_id, %mission_id, "mission abort requested");
        self.sink.send(ServerEvent::update(MISSION_TERMINATED)).await;
        Ok(mission_id)
    }

    /// Tears the session down: terminates the executor and any direct
    /// commands and silences every further event.
    pub fn close(&self) {
        let active = {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.transition(self.connection_id, MissionState::Idle);
            inner.active.take()
        };
        self.sink.close();
        self.jobs.cancel();
        if let Some(ActiveMission {
            id,
            process: Some(process),
            ..
        }) = active
        {
            info!(connection_id = %self.connection_id, mission_id = %id, process_id = %process.id(), "terminating executor for closed session");
            process.terminate();
        }
    }

    /// Runs a raw shell command on behalf of the client.
    ///
    /// Output chunks and the completion are delivered as `command.output` and
    /// `command.complete`. The job is killed if the session closes first.
    pub fn execute_command(
        &self,
        params: CommandExecuteParams,
    ) -> Result<JoinHandle<()>, CommandError> {
        if self.is_closed() {
            return Err(CommandError::SessionClosed);
        }
        if params.command.trim().is_empty() {
            return Err(ValidationError::EmptyCommand.into());
        }
        let request = CommandRequest {
            cwd: self.config.command_cwd(params.cwd.as_deref()),
            command: params.command,
        };
        let connection_id = self.connection_id;
        let config = self.config.command.clone();
        let retention = self.config.executor.max_output_bytes;
        let sink = self.sink.clone();
        let cancel = self.jobs.child_token();
        Ok(tokio::spawn(async move {
            info!(%connection_id, command = %request.command, "direct command started");
            command::relay_command(request, &config, retention, sink, cancel).await;
        }))
    }

    async fn conclude_launch_failure(&self, mission_id: MissionId, error: String) {
        let _announce = self.announce.lock().await;
        let (outcome, deliver) = {
            let mut inner = self.lock();
            let Some(active) = inner.active.take_if(|active| active.id == mission_id) else {
                return;
            };
            let outcome = if active.aborted {
                MissionOutcome::Aborted
            } else {
                MissionOutcome::Failed { error }
            };
            let deliver = self.record_outcome(&mut inner, &outcome);
            (outcome, deliver)
        };
        if deliver {
            self.sink.send(outcome.to_event()).await;
        }
    }

    /// Final step of a running mission. Ignored unless `process_id` is still
    /// the session's active process.
    async fn conclude(&self, mission_id: MissionId, process_id: ProcessId, exit: ProcessExit) {
        let _announce = self.announce.lock().await;
        let (outcome, deliver) = {
            let mut inner = self.lock();
            let matches = inner.active.as_ref().is_some_and(|active| {
                active.id == mission_id && active.process_id() == Some(process_id)
            });
            if !matches {
                debug!(connection_id = %self.connection_id, %mission_id, %process_id, "discarding stale completion");
                return;
            }
            let Some(active) = inner.active.take() else {
                return;
            };
            let outcome = if active.aborted {
                MissionOutcome::Aborted
            } else {
                let output = lock_output(&active.output);
                if output.stdout.dropped_bytes() > 0 || output.stderr.dropped_bytes() > 0 {
                    debug!(
                        connection_id = %self.connection_id,
                        %mission_id,
                        stdout_dropped = output.stdout.dropped_bytes(),
                        stderr_dropped = output.stderr.dropped_bytes(),
                        "mission output exceeded retention; oldest bytes dropped"
                    );
                }
                outcome_for_exit(exit, &output)
            };
            let deliver = self.record_outcome(&mut inner, &outcome);
            (outcome, deliver)
        };
        info!(connection_id = %self.connection_id, %mission_id, %process_id, %exit, ?outcome, "mission concluded");
        if deliver {
            self.sink.send(outcome.to_event()).await;
        }
    }

    fn record_outcome(&self, inner: &mut SessionInner, outcome: &MissionOutcome) -> bool {
        inner.transition(self.connection_id, outcome.state());
        inner.last_outcome = Some(outcome.clone());
        inner.transition(self.connection_id, MissionState::Idle);
        !inner.closed
    }
}

impl Drop for MissionSession {
    fn drop(&mut self) {
        // Dropping the active handle (with `inner`) terminates the executor.
        self.sink.close();
        self.jobs.cancel();
    }
}

fn outcome_for_exit(exit: ProcessExit, output: &MissionOutput) -> MissionOutcome {
    if exit.success() {
        let result = match &output.result {
            Some(result) => result.clone(),
            None => output.stdout.to_string_lossy().trim().to_string(),
        };
        return MissionOutcome::Completed { result };
    }
    let failure = ProcessFailure {
        exit,
        message: failure_message(exit, &output.stderr),
    };
    MissionOutcome::Failed {
        error: failure.to_string(),
    }
}

fn failure_message(exit: ProcessExit, stderr: &CappedOutput) -> String {
    let stderr = stderr.to_string_lossy();
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("executor {exit}")
    } else {
        stderr.to_string()
    }
}

async fn drive_mission(
    session: Weak<MissionSession>,
    sink: EventSink,
    config: Arc<BridgeConfig>,
    mission_id: MissionId,
    process_id: ProcessId,
    io: ProcessIo,
    output: SharedOutput,
) {
    let ProcessIo {
        stdout,
        stderr,
        completion,
    } = io;

    let stdout_task = tokio::spawn(pump_stdout(
        stdout,
        config.classifier.markers(),
        sink.clone(),
        Arc::clone(&output),
    ));
    let stderr_task = tokio::spawn(pump_stderr(stderr, sink, Arc::clone(&output)));

    let exit = completion.await;
    debug!(%mission_id, %process_id, %exit, "executor exited");
    drain(stdout_task, "stdout").await;
    drain(stderr_task, "stderr").await;

    let Some(session) = session.upgrade() else {
        debug!(%mission_id, %process_id, "session gone before mission concluded");
        return;
    };
    session.conclude(mission_id, process_id, exit).await;
}

async fn drain(mut task: JoinHandle<()>, stream: &'static str) {
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(stream, "output pump failed: {err}"),
        Err(_) => {
            warn!(stream, "output still open after executor exit; abandoning it");
            task.abort();
        }
    }
}

/// Copies everything read from the executor's stdout into the mission
/// output before it is classified.
struct RetainingReader<R> {
    inner: R,
    output: SharedOutput,
}

impl<R> AsyncRead for RetainingReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let filled = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = &buf.filled()[filled..];
            if !read.is_empty() {
                lock_output(&this.output).stdout.push(read);
            }
        }
        poll
    }
}

async fn pump_stdout<R>(reader: R, markers: MarkerSet, sink: EventSink, output: SharedOutput)
where
    R: AsyncRead + Unpin,
{
    let reader = RetainingReader {
        inner: reader,
        output: Arc::clone(&output),
    };
    let mut events = std::pin::pin!(classify_stream(reader, markers));
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => relay(&sink, &output, event).await,
            Err(err) => {
                warn!("failed to read executor stdout: {err}");
                break;
            }
        }
    }
}

async fn pump_stderr<R>(mut reader: R, sink: EventSink, output: SharedOutput)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!("failed to read executor stderr: {err}");
                break;
            }
        };
        lock_output(&output).stderr.push(&buf[..n]);
        relay(&sink, &output, ClassifiedEvent::from_error_chunk(&buf[..n])).await;
    }
}

async fn relay(sink: &EventSink, output: &SharedOutput, event: ClassifiedEvent) {
    let event = match event {
        ClassifiedEvent::Status(log) => ServerEvent::update(log),
        ClassifiedEvent::Log(message) => ServerEvent::log(message),
        ClassifiedEvent::Error(error) => ServerEvent::error(error),
        ClassifiedEvent::Result(result) => {
            lock_output(output).result = Some(result.clone());
            ServerEvent::NeuralComplete(NeuralCompleteEvent { result })
        }
    };
    sink.send(event).await;
}
