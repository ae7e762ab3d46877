use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::spawn::ProcessExit;

/// The executor (or shell) could not be started. No process handle exists
/// when this is returned.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("executable `{program}` not found")]
    NotFound { program: String },
    #[error("working directory `{}` does not exist", path.display())]
    WorkingDirectory { path: PathBuf },
    #[error("failed to spawn `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} pipe was unexpectedly not available")]
    MissingPipe(&'static str),
}

impl SpawnError {
    pub(crate) fn io(program: impl Into<String>, source: io::Error) -> Self {
        let program = program.into();
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound { program }
        } else {
            Self::Io { program, source }
        }
    }
}

/// Input rejected before any process is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("mission objective must not be empty")]
    EmptyObjective,
    #[error("command must not be empty")]
    EmptyCommand,
}

/// The executor ran but did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProcessFailure {
    pub exit: ProcessExit,
    pub message: String,
}

/// A direct command outlived its deadline and was killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("command timed out after {}ms", timeout.as_millis())]
pub struct TimeoutExceeded {
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("mission already active")]
    MissionAlreadyActive,
    #[error("no active mission")]
    NoActiveMission,
    #[error("session closed")]
    SessionClosed,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("session closed")]
    SessionClosed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{}`: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
