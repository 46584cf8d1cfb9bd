/// Realtime pub/sub transport: the seam between the chat core and the service
///
/// The chat components only talk to the traits in this module. Two
/// implementations ship with the crate: an in-process one over a shared
/// [`hub::Hub`] and a framed TCP client for the [`broker`].
pub mod broker;
pub mod hub;
pub mod local;
pub mod protocol;
pub mod tcp;

use crate::error::{ChatError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::warn;

pub use hub::Hub;
pub use local::LocalTransport;
pub use tcp::TcpTransport;

/// Raw lifecycle reported by a transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    /// Created, nothing attempted yet
    Initialized,
    /// Fetching credentials or opening the socket
    Connecting,
    /// Authenticated and ready
    Connected,
    /// Lost the connection, a retry is scheduled
    Disconnected,
    /// Retries exhausted for now, retrying at a slower pace
    Suspended,
    /// Close requested
    Closing,
    /// Closed by the local side
    Closed,
    /// Credentials rejected, no further attempts
    Failed,
}

impl TransportState {
    /// States from which no channel operation can succeed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed | Self::Failed)
    }
}

/// A message published on the channel, as the service delivers it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub id: String,
    /// Event name (`message`, `typing`, ...)
    pub name: String,
    /// Publisher, stamped by the service from the authenticated connection
    pub client_id: String,
    /// Unix milliseconds, assigned by the service
    pub timestamp: i64,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    /// Member already present (membership reads)
    Present,
    Enter,
    Update,
    Leave,
}

/// Presence event or membership entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub action: PresenceAction,
    pub client_id: String,
    pub data: serde_json::Value,
    pub timestamp: i64,
}

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// A live listener on a channel. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
    filter: Option<Predicate<T>>,
}

impl<T: Clone> Subscription<T> {
    pub fn new(rx: broadcast::Receiver<T>) -> Self {
        Self { rx, filter: None }
    }

    pub fn filtered(rx: broadcast::Receiver<T>, filter: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            rx,
            filter: Some(Box::new(filter)),
        }
    }

    /// Next matching item, or `None` once the source is gone
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(item) => {
                    if self.filter.as_ref().map_or(true, |f| f(&item)) {
                        return Some(item);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Subscriber lagged, skipped {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The single logical channel of a connection
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Client id this channel publishes as
    fn client_id(&self) -> &str;

    /// Most recent messages, newest-first, at most `limit`
    async fn history(&self, limit: usize) -> Result<Vec<ChannelMessage>>;

    /// Listen for messages with the given event name
    fn subscribe(&self, event: &str) -> Subscription<ChannelMessage>;

    async fn publish(&self, event: &str, data: serde_json::Value) -> Result<()>;

    async fn presence_enter(&self, data: serde_json::Value) -> Result<()>;

    async fn presence_update(&self, data: serde_json::Value) -> Result<()>;

    async fn presence_leave(&self) -> Result<()>;

    /// Authoritative membership view
    async fn presence_get(&self) -> Result<Vec<PresenceMessage>>;

    fn presence_subscribe(&self) -> Subscription<PresenceMessage>;
}

/// One authenticated connection to the service
#[async_trait]
pub trait RealtimeConnection: Send + Sync {
    fn client_id(&self) -> &str;

    fn state(&self) -> watch::Receiver<TransportState>;

    fn channel(&self) -> Arc<dyn RealtimeChannel>;

    async fn close(&self);
}

/// Opens connections. Returns immediately; authentication runs in the background
/// and is observable through [`RealtimeConnection::state`].
pub trait Transport: Send + Sync {
    fn connect(&self, client_id: &str) -> Arc<dyn RealtimeConnection>;
}

/// Wait until the connection is usable, failing fast on terminal states
pub async fn wait_connected(state: &mut watch::Receiver<TransportState>, deadline: Duration) -> Result<()> {
    let waiting = async {
        loop {
            let current = *state.borrow_and_update();
            if current == TransportState::Connected {
                return Ok(());
            }
            if current.is_terminal() {
                return Err(ChatError::Transport(format!("connection is {:?}", current)));
            }
            if state.changed().await.is_err() {
                return Err(ChatError::Transport("connection dropped".to_string()));
            }
        }
    };

    timeout(deadline, waiting)
        .await
        .map_err(|_| ChatError::Timeout("waiting for connection".to_string()))?
}

/// Unix milliseconds now
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_filters() {
        let (tx, rx) = broadcast::channel::<u32>(8);
        let mut sub = Subscription::filtered(rx, |n| n % 2 == 0);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(sub.recv().await, Some(2));
        drop(tx);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_wait_connected_fails_on_terminal_state() {
        let (tx, mut rx) = watch::channel(TransportState::Connecting);
        let waiter = tokio::spawn(async move { wait_connected(&mut rx, Duration::from_secs(5)).await });
        tx.send_replace(TransportState::Failed);
        assert!(waiter.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_wait_connected_succeeds() {
        let (tx, mut rx) = watch::channel(TransportState::Initialized);
        let waiter = tokio::spawn(async move { wait_connected(&mut rx, Duration::from_secs(5)).await });
        tx.send_replace(TransportState::Connecting);
        tx.send_replace(TransportState::Connected);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_connected_times_out() {
        let (_tx, mut rx) = watch::channel(TransportState::Connecting);
        let err = wait_connected(&mut rx, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ChatError::Timeout(_)));
    }
}
