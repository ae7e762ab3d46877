//! WebSocket transport: one [`MissionSession`] per socket.
//!
//! Each socket gets a writer task draining the session's outbound queue and a
//! read loop that parses client frames and dispatches them. Bad frames are
//! answered with `neural.error`; they never close the socket.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::response::Response;
use futures::SinkExt;
use futures::StreamExt;
use stingbot_core::MissionSession;
use stingbot_core::error::SessionError;
use stingbot_protocol::ClientEvent;
use stingbot_protocol::ServerEvent;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::state::AppState;

/// Outbound events buffered per connection before producers wait on the
/// socket writer.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (tx, rx) = async_channel::bounded::<ServerEvent>(OUTBOUND_QUEUE_CAPACITY);
    let session = state.registry.connect(tx);
    let connection_id = session.connection_id();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(err) => {
                    warn!(%connection_id, event = event.name(), "failed to encode event: {err}");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                debug!(%connection_id, "socket closed while writing");
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = state.shutdown.cancelled() => {
                debug!(%connection_id, "gateway shutting down; closing socket");
                break;
            }
        };
        match frame {
            Some(Ok(Message::Text(text))) => dispatch(&session, text.as_str()).await,
            Some(Ok(Message::Close(_))) | None => break,
            // Ping/pong are answered by the transport; binary frames carry nothing for us.
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(%connection_id, "socket read failed: {err}");
                break;
            }
        }
    }

    state.registry.disconnect(connection_id);
    writer.abort();
}

async fn dispatch(session: &MissionSession, text: &str) {
    let connection_id = session.connection_id();
    let event = match ClientEvent::from_json(text) {
        Ok(event) => event,
        Err(err) => {
            warn!(%connection_id, "rejected client frame: {err}");
            session.notify(ServerEvent::error(err.to_string())).await;
            return;
        }
    };

    match event {
        ClientEvent::MissionStart(params) => {
            if let Err(err) = session.start_mission(&params.objective).await {
                info!(%connection_id, "mission.start rejected: {err}");
                session.notify(ServerEvent::error(err.to_string())).await;
            }
        }
        ClientEvent::MissionAbort => match session.abort().await {
            Ok(mission_id) => debug!(%connection_id, %mission_id, "abort dispatched"),
            Err(SessionError::NoActiveMission) => {
                debug!(%connection_id, "mission.abort ignored: no active mission");
            }
            Err(err) => {
                session.notify(ServerEvent::error(err.to_string())).await;
            }
        },
        ClientEvent::CommandExecute(params) => {
            if let Err(err) = session.execute_command(params) {
                info!(%connection_id, "command.execute rejected: {err}");
                session.notify(ServerEvent::error(err.to_string())).await;
            }
        }
    }
}
