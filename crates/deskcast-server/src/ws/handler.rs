use crate::bridge::{self, BridgeReport};
use crate::error::Result;
use crate::rtc::{self, vp8_capability};
use crate::session::{ScreenSession, SessionError, SessionSlot};
use crate::signaling::{SignalingError, SignalingInterpreter};
use crate::state::AppState;
use crate::ws::connections::{ConnectionManager, ConnectionPhase};
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// How long teardown waits for the encoder to be killed and reaped
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Result<Response> {
    let connection_id = Uuid::new_v4();
    let cancel = state
        .connections
        .try_add_connection(connection_id, state.config.max_viewers)
        .await?;

    let connections = state.connections.clone();

    Ok(ws
        .on_failed_upgrade(move |e| {
            tracing::warn!("WebSocket upgrade failed for {}: {}", connection_id, e);
            tokio::spawn(async move {
                connections.remove_connection(connection_id).await;
            });
        })
        .on_upgrade(move |socket| handle_socket(socket, state, connection_id, cancel)))
}

/// Tasks running beside the signaling loop
struct SessionTasks {
    bridge: Option<JoinHandle<BridgeReport>>,
    feedback: JoinHandle<()>,
}

impl SessionTasks {
    /// Wait for the tasks after their token was cancelled
    async fn finish(self, connection_id: Uuid) {
        if let Some(bridge) = self.bridge {
            match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, bridge).await {
                Ok(Ok(report)) => tracing::debug!(
                    "Encoder bridge for {} finished: {} ({} frames)",
                    connection_id,
                    report.exit,
                    report.frames_forwarded
                ),
                Ok(Err(e)) => tracing::error!("Encoder bridge for {} failed: {}", connection_id, e),
                Err(_) => tracing::warn!(
                    "Encoder bridge for {} did not stop within {:?}",
                    connection_id,
                    TASK_SHUTDOWN_TIMEOUT
                ),
            }
        }

        if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, self.feedback)
            .await
            .is_err()
        {
            tracing::warn!("RTCP reader for {} did not stop", connection_id);
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    connection_id: Uuid,
    cancel: CancellationToken,
) {
    tracing::info!("Viewer {} connected", connection_id);

    let (mut sender, mut receiver) = socket.split();
    let session = SessionSlot::new();

    let tasks = match start_session(&state, connection_id, &session, &cancel).await {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::error!("Failed to set up session for {}: {}", connection_id, e);
            let _ = sender.send(Message::Close(None)).await;
            state.connections.remove_connection(connection_id).await;
            return;
        }
    };

    state
        .connections
        .set_phase(connection_id, ConnectionPhase::Negotiating)
        .await;

    let interpreter = SignalingInterpreter::new(session.clone(), state.config.signaling.clone());

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Closing viewer {} for shutdown", connection_id);
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            msg = receiver.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => match interpreter
                .handle_until_cancelled(text.as_str(), &cancel)
                .await
            {
                Ok(Some(reply)) => {
                    if let Err(e) = sender.send(Message::Text(reply.into())).await {
                        tracing::warn!("Failed to send offer to {}: {}", connection_id, e);
                        break;
                    }
                }
                Ok(None) => {}
                // Next iteration sees the token and closes
                Err(SignalingError::Cancelled) => continue,
                Err(e) => tracing::warn!("Signaling error from {}: {}", connection_id, e),
            },
            Some(Ok(Message::Binary(data))) => {
                tracing::trace!(
                    "Ignoring {} byte binary frame from {}",
                    data.len(),
                    connection_id
                );
            }
            Some(Ok(Message::Close(_))) => {
                tracing::info!("Viewer {} sent close", connection_id);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!("WebSocket error for {}: {}", connection_id, e);
                break;
            }
            None => break,
        }
    }

    // Teardown: session first, then every task watching the token
    session.close().await;
    state
        .connections
        .set_phase(connection_id, ConnectionPhase::Closed)
        .await;
    cancel.cancel();
    tasks.finish(connection_id).await;
    state.connections.remove_connection(connection_id).await;

    tracing::info!("Viewer {} disconnected", connection_id);
}

/// Create the session, attach the track, and start the RTCP reader and encoder bridge.
///
/// Media starts right away; nothing waits for negotiation. An encoder that
/// fails to start leaves the session up without video.
async fn start_session(
    state: &AppState,
    connection_id: Uuid,
    slot: &SessionSlot,
    cancel: &CancellationToken,
) -> std::result::Result<SessionTasks, SessionError> {
    let (mut session, track) = ScreenSession::create(&state.rtc, vp8_capability()).await?;

    let rtp_sender = match session.add_track().await {
        Ok(sender) => sender,
        Err(e) => {
            let _ = session.close().await;
            return Err(e);
        }
    };

    watch_peer_state(
        session.peer_connection(),
        state.connections.clone(),
        connection_id,
    );
    slot.install(session).await;

    let feedback = tokio::spawn(rtc::drain_rtcp(rtp_sender, cancel.clone()));

    let bridge = match bridge::spawn_bridge(&state.config.encoder, track, cancel.clone()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!("Encoder for {} not started: {}", connection_id, e);
            None
        }
    };

    Ok(SessionTasks { bridge, feedback })
}

fn watch_peer_state(
    peer_connection: &Arc<RTCPeerConnection>,
    connections: Arc<ConnectionManager>,
    connection_id: Uuid,
) {
    peer_connection.on_peer_connection_state_change(Box::new(
        move |peer_state: RTCPeerConnectionState| {
            let connections = connections.clone();

            Box::pin(async move {
                match peer_state {
                    RTCPeerConnectionState::Connected => {
                        connections
                            .set_phase(connection_id, ConnectionPhase::Streaming)
                            .await;
                    }
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                        tracing::warn!("Peer connection for {} is {}", connection_id, peer_state);
                    }
                    _ => {
                        tracing::debug!("Peer connection for {} is {}", connection_id, peer_state);
                    }
                }
            })
        },
    ));
}
