/// TCP client transport for the broker
///
/// Owns reconnection: a lost socket is reported as `Disconnected` and retried,
/// repeated failures as `Suspended`, and a rejected credential as `Failed`.
use crate::auth::{CredentialSource, TokenRequest};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::realtime::protocol::{read_frame, write_frame, ClientFrame, ServerFrame, PROTOCOL_VERSION};
use crate::realtime::{
    now_millis, wait_connected, ChannelMessage, PresenceMessage, RealtimeChannel, RealtimeConnection, Subscription,
    Transport, TransportState,
};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 256;

/// Timing knobs copied out of [`Config`]
#[derive(Debug, Clone)]
struct Settings {
    connection_timeout: Duration,
    request_timeout: Duration,
    retry_interval: Duration,
    max_connection_attempts: u32,
    suspended_retry_interval: Duration,
    keepalive_interval: Duration,
}

pub struct TcpTransport {
    broker_addr: String,
    channel_name: String,
    credentials: Arc<dyn CredentialSource>,
    settings: Settings,
}

impl TcpTransport {
    pub fn new(config: &Config, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            broker_addr: config.broker_addr.clone(),
            channel_name: config.channel_name.clone(),
            credentials,
            settings: Settings {
                connection_timeout: config.connection_timeout,
                request_timeout: config.request_timeout,
                retry_interval: config.retry_interval,
                max_connection_attempts: config.max_connection_attempts,
                suspended_retry_interval: config.suspended_retry_interval,
                keepalive_interval: config.keepalive_interval,
            },
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&self, client_id: &str) -> Arc<dyn RealtimeConnection> {
        let (state_tx, _) = watch::channel(TransportState::Initialized);
        let (messages, _) = broadcast::channel(EVENT_BUFFER);
        let (presence, _) = broadcast::channel(EVENT_BUFFER);
        let channel = Arc::new(TcpChannel {
            client_id: client_id.to_string(),
            channel_name: self.channel_name.clone(),
            state_tx,
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_req: AtomicU64::new(1),
            messages,
            presence,
            presence_data: Mutex::new(None),
            closed: AtomicBool::new(false),
            request_timeout: self.settings.request_timeout,
        });

        let driver = tokio::spawn(run_driver(
            channel.clone(),
            self.broker_addr.clone(),
            self.credentials.clone(),
            self.settings.clone(),
        ));

        Arc::new(TcpConnection { channel, driver })
    }
}

struct TcpConnection {
    channel: Arc<TcpChannel>,
    driver: JoinHandle<()>,
}

#[async_trait]
impl RealtimeConnection for TcpConnection {
    fn client_id(&self) -> &str {
        &self.channel.client_id
    }

    fn state(&self) -> watch::Receiver<TransportState> {
        self.channel.state_tx.subscribe()
    }

    fn channel(&self) -> Arc<dyn RealtimeChannel> {
        self.channel.clone()
    }

    async fn close(&self) {
        if self.channel.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.channel.state_tx.send_replace(TransportState::Closing);

        // The writer task drains this frame once the driver's sender is dropped
        if let Some(out) = self.channel.outbound.lock().await.take() {
            let _ = out.send(ClientFrame::Close {
                reason: "client closed".to_string(),
            });
        }
        self.driver.abort();
        self.channel.pending.lock().await.clear();
        self.channel.state_tx.send_replace(TransportState::Closed);
        info!("Connection for {} closed", self.channel.client_id);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

struct TcpChannel {
    client_id: String,
    channel_name: String,
    state_tx: watch::Sender<TransportState>,
    /// Writer queue of the live session, `None` while disconnected
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ServerFrame>>>,
    next_req: AtomicU64,
    messages: broadcast::Sender<ChannelMessage>,
    presence: broadcast::Sender<PresenceMessage>,
    /// Presence data to re-announce after a reconnect
    presence_data: Mutex<Option<serde_json::Value>>,
    closed: AtomicBool,
    request_timeout: Duration,
}

impl TcpChannel {
    fn set_state(&self, next: TransportState) {
        self.state_tx.send_if_modified(|state| {
            if self.closed.load(Ordering::SeqCst) || *state == next {
                return false;
            }
            debug!("Transport state for {}: {:?} -> {:?}", self.client_id, state, next);
            *state = next;
            true
        });
    }

    async fn run_session(&self, mut reader: OwnedReadHalf, writer: OwnedWriteHalf, keepalive: Duration) {
        let (tx, rx) = mpsc::unbounded_channel::<ClientFrame>();
        *self.outbound.lock().await = Some(tx.clone());
        self.set_state(TransportState::Connected);

        // Membership does not survive the old socket; announce it again
        if let Some(data) = self.presence_data.lock().await.clone() {
            let req = self.next_req.fetch_add(1, Ordering::Relaxed);
            let _ = tx.send(ClientFrame::PresenceEnter { req, data });
        }
        drop(tx);

        let writer_task = tokio::spawn(write_loop(writer, rx, keepalive));

        loop {
            match timeout(keepalive * 3, read_frame::<ServerFrame, _>(&mut reader)).await {
                Ok(Ok(Some(frame))) => self.dispatch(frame).await,
                Ok(Ok(None)) => {
                    debug!("Broker closed the connection for {}", self.client_id);
                    break;
                }
                Ok(Err(e)) => {
                    warn!("Read from broker failed: {}", e);
                    break;
                }
                Err(_) => {
                    warn!("Broker silent for {:?}, dropping connection", keepalive * 3);
                    break;
                }
            }
        }

        writer_task.abort();
        *self.outbound.lock().await = None;
        // Waiting requests see their reply sender dropped
        self.pending.lock().await.clear();
    }

    async fn dispatch(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Message { message } => {
                let _ = self.messages.send(message);
            }
            ServerFrame::Presence { event } => {
                let _ = self.presence.send(event);
            }
            ServerFrame::Pong { timestamp } => {
                debug!("Pong after {} ms", now_millis() - timestamp);
            }
            ServerFrame::AuthOk { .. } | ServerFrame::AuthError { .. } => {
                warn!("Unexpected auth frame mid-session");
            }
            response => {
                let Some(req) = response.req() else {
                    return;
                };
                match self.pending.lock().await.remove(&req) {
                    Some(reply) => {
                        let _ = reply.send(response);
                    }
                    None => debug!("Unsolicited response for request {}", req),
                }
            }
        }
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientFrame + Send) -> Result<ServerFrame> {
        let mut state = self.state_tx.subscribe();
        wait_connected(&mut state, self.request_timeout).await?;

        let req = self.next_req.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(req, reply_tx);

        let sent = match self.outbound.lock().await.as_ref() {
            Some(out) => out.send(build(req)).is_ok(),
            None => false,
        };
        if !sent {
            self.pending.lock().await.remove(&req);
            return Err(ChatError::Transport("not connected".to_string()));
        }

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ChatError::Transport("connection lost before reply".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&req);
                Err(ChatError::Timeout(format!("request {} timed out", req)))
            }
        }
    }

    async fn acknowledged(&self, build: impl FnOnce(u64) -> ClientFrame + Send, rejected: fn(String) -> ChatError) -> Result<()> {
        match self.request(build).await? {
            ServerFrame::Ack { .. } => Ok(()),
            ServerFrame::Nack { reason, .. } => Err(rejected(reason)),
            other => Err(ChatError::Protocol(format!("unexpected reply: {:?}", other))),
        }
    }
}

#[async_trait]
impl RealtimeChannel for TcpChannel {
    fn name(&self) -> &str {
        &self.channel_name
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn history(&self, limit: usize) -> Result<Vec<ChannelMessage>> {
        match self.request(|req| ClientFrame::History { req, limit }).await? {
            ServerFrame::HistoryResult { items, .. } => Ok(items),
            ServerFrame::Nack { reason, .. } => Err(ChatError::Transport(reason)),
            other => Err(ChatError::Protocol(format!("unexpected reply: {:?}", other))),
        }
    }

    fn subscribe(&self, event: &str) -> Subscription<ChannelMessage> {
        let event = event.to_string();
        Subscription::filtered(self.messages.subscribe(), move |m| m.name == event)
    }

    async fn publish(&self, event: &str, data: serde_json::Value) -> Result<()> {
        let name = event.to_string();
        self.acknowledged(|req| ClientFrame::Publish { req, name, data }, ChatError::Publish)
            .await
    }

    async fn presence_enter(&self, data: serde_json::Value) -> Result<()> {
        let announced = data.clone();
        self.acknowledged(|req| ClientFrame::PresenceEnter { req, data }, ChatError::Presence)
            .await?;
        *self.presence_data.lock().await = Some(announced);
        Ok(())
    }

    async fn presence_update(&self, data: serde_json::Value) -> Result<()> {
        let announced = data.clone();
        self.acknowledged(|req| ClientFrame::PresenceUpdate { req, data }, ChatError::Presence)
            .await?;
        *self.presence_data.lock().await = Some(announced);
        Ok(())
    }

    async fn presence_leave(&self) -> Result<()> {
        *self.presence_data.lock().await = None;
        self.acknowledged(|req| ClientFrame::PresenceLeave { req }, ChatError::Presence)
            .await
    }

    async fn presence_get(&self) -> Result<Vec<PresenceMessage>> {
        match self.request(|req| ClientFrame::PresenceGet { req }).await? {
            ServerFrame::PresenceResult { members, .. } => Ok(members),
            ServerFrame::Nack { reason, .. } => Err(ChatError::Presence(reason)),
            other => Err(ChatError::Protocol(format!("unexpected reply: {:?}", other))),
        }
    }

    fn presence_subscribe(&self) -> Subscription<PresenceMessage> {
        Subscription::new(self.presence.subscribe())
    }
}

/// Connect, authenticate, serve, and retry until closed or rejected
async fn run_driver(
    channel: Arc<TcpChannel>,
    broker_addr: String,
    credentials: Arc<dyn CredentialSource>,
    settings: Settings,
) {
    let mut failures: u32 = 0;

    loop {
        if channel.closed.load(Ordering::SeqCst) {
            break;
        }
        channel.set_state(TransportState::Connecting);

        let token = match credentials.fetch(&channel.client_id).await {
            Ok(token) => token,
            Err(e) => {
                error!("Could not obtain credentials for {}: {}", channel.client_id, e);
                channel.set_state(TransportState::Failed);
                break;
            }
        };

        match establish(&broker_addr, token, settings.connection_timeout).await {
            Ok((reader, writer, connection_id)) => {
                failures = 0;
                info!("Connected to broker {} as {} (connection {})", broker_addr, channel.client_id, connection_id);
                channel.run_session(reader, writer, settings.keepalive_interval).await;
                if channel.closed.load(Ordering::SeqCst) {
                    break;
                }
                warn!("Lost connection to broker {}", broker_addr);
            }
            Err(ChatError::Credential(reason)) => {
                error!("Broker rejected credentials for {}: {}", channel.client_id, reason);
                channel.set_state(TransportState::Failed);
                break;
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "Connection attempt {}/{} to {} failed: {}",
                    failures, settings.max_connection_attempts, broker_addr, e
                );
            }
        }

        let delay = if failures >= settings.max_connection_attempts {
            channel.set_state(TransportState::Suspended);
            settings.suspended_retry_interval
        } else {
            channel.set_state(TransportState::Disconnected);
            with_jitter(settings.retry_interval)
        };
        sleep(delay).await;
    }
}

async fn establish(
    broker_addr: &str,
    token: TokenRequest,
    connection_timeout: Duration,
) -> Result<(OwnedReadHalf, OwnedWriteHalf, String)> {
    let stream = timeout(connection_timeout, TcpStream::connect(broker_addr))
        .await
        .map_err(|_| ChatError::Timeout(format!("connect to {}", broker_addr)))?
        .map_err(ChatError::Io)?;
    stream.set_nodelay(true)?;

    let (mut reader, mut writer) = stream.into_split();
    write_frame(
        &mut writer,
        &ClientFrame::Auth {
            protocol_version: PROTOCOL_VERSION,
            token,
        },
    )
    .await?;

    match timeout(connection_timeout, read_frame::<ServerFrame, _>(&mut reader)).await {
        Ok(Ok(Some(ServerFrame::AuthOk { connection_id, .. }))) => Ok((reader, writer, connection_id)),
        Ok(Ok(Some(ServerFrame::AuthError { reason }))) => Err(ChatError::Credential(reason)),
        Ok(Ok(Some(other))) => Err(ChatError::Protocol(format!("expected auth reply, got {:?}", other))),
        Ok(Ok(None)) => Err(ChatError::Transport("broker closed during handshake".to_string())),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ChatError::Timeout("auth handshake".to_string())),
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<ClientFrame>, keepalive: Duration) {
    let mut ticker = interval(keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("Write to broker failed: {}", e);
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = write_frame(&mut writer, &ClientFrame::Ping { timestamp: now_millis() }).await {
                    debug!("Keepalive ping failed: {}", e);
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

fn with_jitter(base: Duration) -> Duration {
    let spread = (base.as_millis() as u64 / 4).max(1);
    base + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
}
