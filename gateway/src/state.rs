use std::sync::Arc;
use std::time::Instant;

use stingbot_core::BridgeConfig;
use stingbot_core::ConnectionRegistry;
use tokio_util::sync::CancellationToken;

/// Shared by every HTTP and WebSocket handler.
#[derive(Debug)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub started_at: Instant,
    /// Fires once the gateway begins shutting down; open sockets stop reading.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: BridgeConfig, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            registry: ConnectionRegistry::new(config),
            started_at: Instant::now(),
            shutdown,
        })
    }
}
