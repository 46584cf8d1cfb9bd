/// TCP broker: serves the hub to remote clients over the framed protocol
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::realtime::protocol::{read_frame, write_frame, ClientFrame, ServerFrame, PROTOCOL_VERSION};
use crate::realtime::Hub;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Accepts client connections and bridges them onto a [`Hub`]
pub struct Broker {
    hub: Arc<Hub>,
    auth_timeout: Duration,
    idle_timeout: Duration,
}

impl Broker {
    pub fn new(hub: Arc<Hub>, config: &Config) -> Self {
        Self {
            hub,
            auth_timeout: config.connection_timeout,
            // Clients ping every keepalive interval; three missed pings means gone
            idle_timeout: config.keepalive_interval * 3,
        }
    }

    /// Bind and serve forever
    pub async fn start(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(ChatError::Io)?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Broker listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let broker = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = broker.handle_connection(stream, addr).await {
                            warn!("Connection from {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!("Incoming connection from {}", addr);
        let (mut reader, mut writer) = stream.into_split();

        let first = timeout(self.auth_timeout, read_frame::<ClientFrame, _>(&mut reader))
            .await
            .map_err(|_| ChatError::Timeout(format!("no auth frame from {}", addr)))??;

        let client_id = match first {
            Some(ClientFrame::Auth { protocol_version, token }) => {
                if protocol_version != PROTOCOL_VERSION {
                    let reason = format!("unsupported protocol version {}", protocol_version);
                    write_frame(&mut writer, &ServerFrame::AuthError { reason: reason.clone() }).await?;
                    return Err(ChatError::Protocol(reason));
                }
                match self.hub.authenticate(&token) {
                    Ok(client_id) => client_id,
                    Err(e) => {
                        write_frame(&mut writer, &ServerFrame::AuthError { reason: e.to_string() }).await?;
                        return Err(e);
                    }
                }
            }
            Some(other) => {
                let reason = format!("expected auth, got {}", other.frame_type());
                write_frame(&mut writer, &ServerFrame::AuthError { reason: reason.clone() }).await?;
                return Err(ChatError::Protocol(reason));
            }
            None => return Ok(()),
        };

        let connection_id = Uuid::new_v4().to_string();
        info!("Client {} authenticated from {} (connection {})", client_id, addr, connection_id);

        // Subscribe before acknowledging so nothing published after AuthOk is missed
        let messages = self.hub.subscribe_messages();
        let presence = self.hub.subscribe_presence();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("Write to client failed: {}", e);
                    break;
                }
            }
        });

        let _ = out_tx.send(ServerFrame::AuthOk {
            connection_id: connection_id.clone(),
            client_id: client_id.clone(),
            channel: self.hub.channel_name().to_string(),
        });

        let message_task = forward(messages, out_tx.clone(), |message| ServerFrame::Message { message });
        let presence_task = forward(presence, out_tx.clone(), |event| ServerFrame::Presence { event });

        let result = self
            .serve_requests(&mut reader, &out_tx, &connection_id, &client_id)
            .await;

        // Ghost members are not allowed to outlive their connection
        self.hub.release_connection(&connection_id, &client_id).await;
        message_task.abort();
        presence_task.abort();
        drop(out_tx);
        let _ = writer_task.await;

        info!("Client {} disconnected (connection {})", client_id, connection_id);
        result
    }

    async fn serve_requests(
        &self,
        reader: &mut OwnedReadHalf,
        out: &mpsc::UnboundedSender<ServerFrame>,
        connection_id: &str,
        client_id: &str,
    ) -> Result<()> {
        loop {
            let frame = match timeout(self.idle_timeout, read_frame::<ClientFrame, _>(reader)).await {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => {
                    debug!("Connection closed by client {}", client_id);
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(ChatError::Timeout(format!("client {} went silent", client_id)));
                }
            };

            let reply = match frame {
                ClientFrame::Publish { req, name, .. } if name.is_empty() => Some(ServerFrame::Nack {
                    req,
                    reason: "event name is required".to_string(),
                }),
                ClientFrame::Publish { req, name, data } => {
                    self.hub.publish(client_id, &name, data).await;
                    Some(ServerFrame::Ack { req })
                }
                ClientFrame::History { req, limit: 0 } => Some(ServerFrame::Nack {
                    req,
                    reason: "history limit must be positive".to_string(),
                }),
                ClientFrame::History { req, limit } => Some(ServerFrame::HistoryResult {
                    req,
                    items: self.hub.history(limit).await,
                }),
                ClientFrame::PresenceEnter { req, data } => {
                    self.hub.presence_enter(connection_id, client_id, data).await;
                    Some(ServerFrame::Ack { req })
                }
                ClientFrame::PresenceUpdate { req, data } => {
                    self.hub.presence_update(connection_id, client_id, data).await;
                    Some(ServerFrame::Ack { req })
                }
                ClientFrame::PresenceLeave { req } => {
                    self.hub.presence_leave(connection_id, client_id).await;
                    Some(ServerFrame::Ack { req })
                }
                ClientFrame::PresenceGet { req } => Some(ServerFrame::PresenceResult {
                    req,
                    members: self.hub.presence_get().await,
                }),
                ClientFrame::Ping { timestamp } => Some(ServerFrame::Pong { timestamp }),
                ClientFrame::Close { reason } => {
                    info!("Client {} closed connection: {}", client_id, reason);
                    return Ok(());
                }
                ClientFrame::Auth { .. } => {
                    warn!("Duplicate auth frame from {}", client_id);
                    None
                }
            };

            if let Some(reply) = reply {
                if out.send(reply).is_err() {
                    return Err(ChatError::Transport("writer closed".to_string()));
                }
            }
        }
    }
}

/// Forward hub events to one client's writer until either side goes away
fn forward<T, F>(
    mut rx: broadcast::Receiver<T>,
    out: mpsc::UnboundedSender<ServerFrame>,
    wrap: F,
) -> tokio::task::JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(T) -> ServerFrame + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    if out.send(wrap(item)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Client is too slow, skip lagged events and continue
                    warn!("Broker client lagged {} events", n);
                    continue;
                }
                Err(_) => break,
            }
        }
    })
}

