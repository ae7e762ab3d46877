//! Mission execution bridge: supervises the external executor for each
//! connected client and turns its output into protocol events.

pub mod classifier;
pub mod command;
pub mod config;
pub mod error;
pub mod output;
pub mod registry;
pub mod session;
pub mod spawn;

pub use classifier::ClassifiedEvent;
pub use classifier::LineClassifier;
pub use classifier::MarkerSet;
pub use command::CommandCompletion;
pub use command::CommandExit;
pub use command::CommandRequest;
pub use config::BridgeConfig;
pub use config::GatewayConfig;
pub use registry::ConnectionRegistry;
pub use session::ConnectionId;
pub use session::MissionId;
pub use session::MissionOutcome;
pub use session::MissionSession;
pub use session::MissionState;
