use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of one viewer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Admitted, WebSocket upgrade in progress
    Connecting,
    /// Session and encoder running, offer/answer under way
    Negotiating,
    /// Peer connection reported `connected`
    Streaming,
    Closed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Negotiating => "negotiating",
            ConnectionPhase::Streaming => "streaming",
            ConnectionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("viewer limit of {0} reached")]
    Full(usize),

    #[error("server is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub phase: ConnectionPhase,
    /// Cancelled on teardown or server shutdown; every task of the connection watches it
    pub cancel: CancellationToken,
}

/// Registry of live viewer connections
pub struct ConnectionManager {
    /// Parent of every connection token
    shutdown: CancellationToken,
    connections: RwLock<HashMap<Uuid, ConnectionInfo>>,
    /// Signalled whenever the registry becomes empty
    idle: Notify,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            connections: RwLock::new(HashMap::new()),
            idle: Notify::new(),
        }
    }

    /// Admit a connection if there is room, returning its cancellation token
    pub async fn try_add_connection(
        &self,
        connection_id: Uuid,
        max_connections: usize,
    ) -> Result<CancellationToken, AdmissionError> {
        if self.shutdown.is_cancelled() {
            return Err(AdmissionError::ShuttingDown);
        }

        let mut connections = self.connections.write().await;
        if connections.len() >= max_connections {
            return Err(AdmissionError::Full(max_connections));
        }

        let cancel = self.shutdown.child_token();
        connections.insert(
            connection_id,
            ConnectionInfo {
                phase: ConnectionPhase::Connecting,
                cancel: cancel.clone(),
            },
        );

        tracing::debug!(
            "Admitted connection {} ({} active)",
            connection_id,
            connections.len()
        );

        Ok(cancel)
    }

    pub async fn set_phase(&self, connection_id: Uuid, phase: ConnectionPhase) {
        if let Some(info) = self.connections.write().await.get_mut(&connection_id) {
            if info.phase != phase {
                tracing::info!("Connection {}: {} -> {}", connection_id, info.phase, phase);
                info.phase = phase;
            }
        }
    }

    pub async fn phase(&self, connection_id: Uuid) -> Option<ConnectionPhase> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|info| info.phase)
    }

    /// Phases of all live connections
    pub async fn phases(&self) -> Vec<ConnectionPhase> {
        self.connections
            .read()
            .await
            .values()
            .map(|info| info.phase)
            .collect()
    }

    pub async fn remove_connection(&self, connection_id: Uuid) {
        let mut connections = self.connections.write().await;

        if let Some(info) = connections.remove(&connection_id) {
            info.cancel.cancel();
            tracing::debug!(
                "Connection {} removed in phase {}",
                connection_id,
                info.phase
            );
        }

        if connections.is_empty() {
            self.idle.notify_waiters();
        }
    }

    pub async fn active_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Cancel every connection and refuse new ones
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until no connections remain. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.idle.notified();
            if self.active_count().await == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.active_count().await == 0;
            }
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
