#![allow(clippy::expect_used)]

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use stingbot_core::BridgeConfig;
use stingbot_protocol::ServerEvent;
use tempfile::TempDir;

/// Generous upper bound for anything a test waits on.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Executor stand-in: a `/bin/sh` script whose `$1` is the mission objective.
pub struct MockExecutor {
    pub dir: TempDir,
    pub config: BridgeConfig,
}

impl MockExecutor {
    pub fn new(script: &str) -> Self {
        let dir = tempfile::tempdir().expect("create executor working dir");
        let mut config = BridgeConfig::default();
        config.executor.program = PathBuf::from("/bin/sh");
        config.executor.args = vec![
            "-c".to_string(),
            script.to_string(),
            "executor".to_string(),
        ];
        config.executor.working_dir = dir.path().to_path_buf();
        config.executor.kill_grace_ms = 500;
        Self { dir, config }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command.timeout_ms = timeout.as_millis() as u64;
        self
    }
}

pub async fn recv_event(rx: &async_channel::Receiver<ServerEvent>) -> anyhow::Result<ServerEvent> {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .context("timed out waiting for an event")?
        .context("event channel closed")
}

/// Collects events up to and including the first one `done` accepts.
pub async fn recv_until<F>(
    rx: &async_channel::Receiver<ServerEvent>,
    mut done: F,
) -> anyhow::Result<Vec<ServerEvent>>
where
    F: FnMut(&ServerEvent) -> bool,
{
    let mut events = Vec::new();
    loop {
        let event = recv_event(rx).await?;
        let finished = done(&event);
        events.push(event);
        if finished {
            return Ok(events);
        }
    }
}

pub fn is_mission_complete(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::MissionComplete(_))
}

pub fn is_command_complete(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::CommandComplete(_))
}

/// Asserts nothing arrives within `quiet`.
pub async fn assert_no_event(rx: &async_channel::Receiver<ServerEvent>, quiet: Duration) {
    if let Ok(Ok(event)) = tokio::time::timeout(quiet, rx.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

/// Polls `condition` until it holds or [`EVENT_TIMEOUT`] passes.
pub async fn wait_until<F>(mut condition: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("condition never became true")
}

/// Reads the pid a mock executor wrote with `echo $$ > pid`.
pub fn read_pid(dir: &Path) -> Option<u32> {
    std::fs::read_to_string(dir.join("pid"))
        .ok()
        .and_then(|pid| pid.trim().parse().ok())
}

/// Returns whether a process with `pid` still exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
