//! Wire types shared by the gateway and its clients.
//!
//! Every WebSocket frame is a JSON object of the form
//! `{"event": "<name>", "data": {...}}`. Client frames are parsed through
//! [`ClientEvent::from_json`] so that malformed input can be reported back to
//! the peer instead of tearing down the connection.

mod events;
mod http;

pub use events::ClientEvent;
pub use events::CommandCompleteEvent;
pub use events::CommandExecuteParams;
pub use events::CommandOutputEvent;
pub use events::MissionCompleteEvent;
pub use events::MissionStartParams;
pub use events::NeuralCompleteEvent;
pub use events::NeuralErrorEvent;
pub use events::NeuralLogEvent;
pub use events::NeuralUpdateEvent;
pub use events::ProtocolError;
pub use events::ServerEvent;
pub use http::HealthResponse;
pub use http::StatusResponse;

/// Exit code reported by `command.complete` when the command hit its deadline.
pub const COMMAND_TIMEOUT_EXIT_CODE: i32 = 124;
