use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use chrono::Utc;
use stingbot_protocol::ServerEvent;
use tracing::info;

use crate::config::BridgeConfig;
use crate::output::EventSink;
use crate::session::ConnectionId;
use crate::session::MissionSession;

/// Live sessions keyed by connection.
///
/// The map lock only guards insert/remove/lookup; it is never held while a
/// session does I/O.
#[derive(Debug)]
pub struct ConnectionRegistry {
    config: Arc<BridgeConfig>,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<ConnectionId, Arc<MissionSession>>>,
}

impl ConnectionRegistry {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config: Arc::new(config),
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<MissionSession>>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Registers a new connection whose events go to `tx`.
    pub fn connect(&self, tx: async_channel::Sender<ServerEvent>) -> Arc<MissionSession> {
        let connection_id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = MissionSession::new(
            connection_id,
            Arc::clone(&self.config),
            EventSink::new(tx),
        );
        let connections = {
            let mut sessions = self.sessions();
            sessions.insert(connection_id, Arc::clone(&session));
            sessions.len()
        };
        info!(%connection_id, connections, "client connected");
        session
    }

    /// Removes the session and terminates whatever it was running. Returns
    /// `false` for an unknown id.
    pub fn disconnect(&self, connection_id: ConnectionId) -> bool {
        let removed = self.sessions().remove(&connection_id);
        let Some(session) = removed else {
            return false;
        };
        session.close();
        let connected_secs = (Utc::now() - session.created_at()).num_seconds();
        info!(
            %connection_id,
            connected_secs,
            connections = self.connection_count(),
            "client disconnected"
        );
        true
    }

    pub fn connection_count(&self) -> usize {
        self.sessions().len()
    }

    pub fn active_missions(&self) -> usize {
        self.sessions()
            .values()
            .filter(|session| session.has_active_mission())
            .count()
    }

    /// Closes every session. Used on gateway shutdown.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<MissionSession>> = {
            let mut map = self.sessions();
            map.drain().map(|(_, session)| session).collect()
        };
        if !sessions.is_empty() {
            info!(count = sessions.len(), "closing remaining sessions");
        }
        for session in sessions {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn connect_and_disconnect_track_sessions() {
        let registry = ConnectionRegistry::new(BridgeConfig::default());
        let (tx_a, _rx_a) = async_channel::unbounded();
        let (tx_b, _rx_b) = async_channel::unbounded();
        let a = registry.connect(tx_a);
        let b = registry.connect(tx_b);
        assert_ne!(a.connection_id(), b.connection_id());
        assert_eq!(registry.connection_count(), 2);
        assert_eq!(registry.active_missions(), 0);

        assert!(registry.disconnect(a.connection_id()));
        assert!(!registry.disconnect(a.connection_id()));
        assert!(a.is_closed());
        assert_eq!(registry.connection_count(), 1);

        registry.shutdown();
        assert!(b.is_closed());
        assert_eq!(registry.connection_count(), 0);
    }
}
