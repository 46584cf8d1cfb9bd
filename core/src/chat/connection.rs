/// Connection registry: at most one realtime connection per client identity
use crate::error::{ChatError, Result};
use crate::identity::ClientIdentity;
use crate::realtime::{RealtimeChannel, RealtimeConnection, Transport, TransportState};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info};

/// Connection state as the chat layer sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl From<TransportState> for ConnectionState {
    fn from(state: TransportState) -> Self {
        match state {
            TransportState::Initialized | TransportState::Connecting => ConnectionState::Connecting,
            TransportState::Connected => ConnectionState::Connected,
            TransportState::Disconnected | TransportState::Suspended => ConnectionState::Disconnected,
            TransportState::Closing | TransportState::Closed | TransportState::Failed => ConnectionState::Failed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Lazy sequence of connection states. The first `next` yields the current
/// state, later calls wait for the next distinct one.
pub struct StateObserver {
    rx: watch::Receiver<TransportState>,
    last: Option<ConnectionState>,
}

impl StateObserver {
    fn new(rx: watch::Receiver<TransportState>) -> Self {
        Self { rx, last: None }
    }

    pub fn current(&self) -> ConnectionState {
        ConnectionState::from(*self.rx.borrow())
    }

    /// `None` once the connection has been dropped entirely
    pub async fn next(&mut self) -> Option<ConnectionState> {
        loop {
            let state = ConnectionState::from(*self.rx.borrow_and_update());
            if self.last != Some(state) {
                self.last = Some(state);
                return Some(state);
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Wait until the connection reaches `target`
    pub async fn wait_for(&mut self, target: ConnectionState, deadline: Duration) -> Result<()> {
        let reached = timeout(deadline, self.rx.wait_for(|s| ConnectionState::from(*s) == target))
            .await
            .map_err(|_| ChatError::Timeout(format!("waiting for {} state", target)))?;
        reached
            .map(|_| ())
            .map_err(|_| ChatError::Transport("connection dropped".to_string()))
    }
}

/// Shared handle on the connection's single channel
#[derive(Clone)]
pub struct ChannelHandle {
    channel: Arc<dyn RealtimeChannel>,
    state: watch::Receiver<TransportState>,
}

impl ChannelHandle {
    pub fn new(channel: Arc<dyn RealtimeChannel>, state: watch::Receiver<TransportState>) -> Self {
        Self { channel, state }
    }

    /// Raw state of the connection behind this channel
    pub fn state(&self) -> watch::Receiver<TransportState> {
        self.state.clone()
    }
}

impl Deref for ChannelHandle {
    type Target = dyn RealtimeChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.channel.name())
            .field("client_id", &self.channel.client_id())
            .finish()
    }
}

/// Owns the realtime connections, keyed by client id
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    connections: Mutex<HashMap<String, Arc<dyn RealtimeConnection>>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Channel for `identity`, opening the connection on first use
    pub async fn connect(&self, identity: &ClientIdentity) -> ChannelHandle {
        let mut connections = self.connections.lock().await;
        let connection = connections
            .entry(identity.id.clone())
            .or_insert_with(|| {
                info!("Opening connection for {}", identity.id);
                self.transport.connect(&identity.id)
            })
            .clone();
        ChannelHandle::new(connection.channel(), connection.state())
    }

    /// State stream of an open connection
    pub async fn observe_state(&self, client_id: &str) -> Option<StateObserver> {
        let connections = self.connections.lock().await;
        connections
            .get(client_id)
            .map(|connection| StateObserver::new(connection.state()))
    }

    /// Close and forget the connection for `client_id`
    pub async fn disconnect(&self, client_id: &str) {
        let connection = self.connections.lock().await.remove(client_id);
        if let Some(connection) = connection {
            connection.close().await;
            debug!("Disconnected {}", client_id);
        }
    }

    pub async fn disconnect_all(&self) {
        let drained: Vec<_> = self.connections.lock().await.drain().collect();
        for (client_id, connection) in drained {
            connection.close().await;
            debug!("Disconnected {}", client_id);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ApiKey, LocalCredentials, TokenIssuer};
    use crate::realtime::{Hub, LocalTransport};

    fn manager(credentials: LocalCredentials) -> ConnectionManager {
        let issuer = TokenIssuer::new(ApiKey::parse("test:secret").unwrap(), Duration::from_secs(60));
        let hub = Hub::new("room", 10, Some(issuer));
        let transport = LocalTransport::new(hub, Arc::new(credentials), Duration::from_secs(5));
        ConnectionManager::new(Arc::new(transport))
    }

    fn signed() -> LocalCredentials {
        LocalCredentials::new(TokenIssuer::new(
            ApiKey::parse("test:secret").unwrap(),
            Duration::from_secs(60),
        ))
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(ConnectionState::from(TransportState::Initialized), ConnectionState::Connecting);
        assert_eq!(ConnectionState::from(TransportState::Suspended), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::from(TransportState::Closed), ConnectionState::Failed);
        assert_eq!(ConnectionState::from(TransportState::Failed), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_same_identity_reuses_connection() {
        let manager = manager(signed());
        let alice = ClientIdentity::new("alice-1", "Alice");
        manager.connect(&alice).await;
        manager.connect(&alice).await;
        assert_eq!(manager.connection_count().await, 1);

        manager.connect(&ClientIdentity::new("bob-2", "Bob")).await;
        assert_eq!(manager.connection_count().await, 2);

        manager.disconnect("alice-1").await;
        assert_eq!(manager.connection_count().await, 1);
        assert!(manager.observe_state("alice-1").await.is_none());
    }

    #[tokio::test]
    async fn test_observer_reports_connected() {
        let manager = manager(signed());
        manager.connect(&ClientIdentity::new("alice-1", "Alice")).await;
        let mut observer = manager.observe_state("alice-1").await.unwrap();
        observer
            .wait_for(ConnectionState::Connected, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(observer.current(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_credential_failure_is_persistent_failed() {
        let manager = manager(LocalCredentials::unconfigured());
        manager.connect(&ClientIdentity::new("alice-1", "Alice")).await;
        let mut observer = manager.observe_state("alice-1").await.unwrap();

        let mut seen = Vec::new();
        while let Some(state) = observer.next().await {
            seen.push(state);
            if state == ConnectionState::Failed {
                break;
            }
        }
        assert_eq!(seen.last(), Some(&ConnectionState::Failed));
        assert!(!seen.contains(&ConnectionState::Connected));
        assert_eq!(observer.current(), ConnectionState::Failed);
    }
}
