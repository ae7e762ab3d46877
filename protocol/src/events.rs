use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const MISSION_START: &str = "mission.start";
pub const MISSION_ABORT: &str = "mission.abort";
pub const COMMAND_EXECUTE: &str = "command.execute";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid payload for `{event}`: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionStartParams {
    pub objective: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExecuteParams {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Requests a client may send over the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "mission.start")]
    MissionStart(MissionStartParams),
    #[serde(rename = "mission.abort")]
    MissionAbort,
    #[serde(rename = "command.execute")]
    CommandExecute(CommandExecuteParams),
}

#[derive(Deserialize)]
struct ClientEnvelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl ClientEvent {
    /// Parses a client frame. `data` may be omitted for events without a
    /// payload.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let envelope: ClientEnvelope =
            serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        let ClientEnvelope { event, data } = envelope;
        match event.as_str() {
            MISSION_START => parse_payload(&event, data).map(Self::MissionStart),
            MISSION_ABORT => Ok(Self::MissionAbort),
            COMMAND_EXECUTE => parse_payload(&event, data).map(Self::CommandExecute),
            _ => Err(ProtocolError::UnknownEvent(event)),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn parse_payload<T>(event: &str, data: Value) -> Result<T, ProtocolError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidPayload {
        event: event.to_string(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeuralUpdateEvent {
    pub log: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeuralLogEvent {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeuralErrorEvent {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeuralCompleteEvent {
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MissionCompleteEvent {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutputEvent {
    pub chunk: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandCompleteEvent {
    pub code: i32,
    pub output: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Events pushed from the gateway to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "neural.update")]
    NeuralUpdate(NeuralUpdateEvent),
    #[serde(rename = "neural.log")]
    NeuralLog(NeuralLogEvent),
    #[serde(rename = "neural.error")]
    NeuralError(NeuralErrorEvent),
    #[serde(rename = "neural.complete")]
    NeuralComplete(NeuralCompleteEvent),
    #[serde(rename = "mission.complete")]
    MissionComplete(MissionCompleteEvent),
    #[serde(rename = "command.output")]
    CommandOutput(CommandOutputEvent),
    #[serde(rename = "command.complete")]
    CommandComplete(CommandCompleteEvent),
}

impl ServerEvent {
    pub fn update(log: impl Into<String>) -> Self {
        Self::NeuralUpdate(NeuralUpdateEvent { log: log.into() })
    }

    pub fn log(message: impl Into<String>) -> Self {
        Self::NeuralLog(NeuralLogEvent {
            message: message.into(),
        })
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::NeuralError(NeuralErrorEvent {
            error: error.into(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NeuralUpdate(_) => "neural.update",
            Self::NeuralLog(_) => "neural.log",
            Self::NeuralError(_) => "neural.error",
            Self::NeuralComplete(_) => "neural.complete",
            Self::MissionComplete(_) => "mission.complete",
            Self::CommandOutput(_) => "command.output",
            Self::CommandComplete(_) => "command.complete",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
