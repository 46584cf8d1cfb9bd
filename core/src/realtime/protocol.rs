/// Wire protocol between the TCP broker and its clients
use crate::auth::TokenRequest;
use crate::error::{ChatError, Result};
use crate::realtime::{ChannelMessage, PresenceMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest accepted frame payload
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Frames sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every connection
    Auth {
        protocol_version: u8,
        token: TokenRequest,
    },

    Publish {
        req: u64,
        name: String,
        data: serde_json::Value,
    },

    History { req: u64, limit: usize },

    PresenceEnter { req: u64, data: serde_json::Value },

    PresenceUpdate { req: u64, data: serde_json::Value },

    PresenceLeave { req: u64 },

    PresenceGet { req: u64 },

    Ping { timestamp: i64 },

    Close { reason: String },
}

/// Frames sent by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthOk {
        connection_id: String,
        client_id: String,
        channel: String,
    },

    AuthError { reason: String },

    /// Request completed
    Ack { req: u64 },

    /// Request rejected
    Nack { req: u64, reason: String },

    HistoryResult {
        req: u64,
        items: Vec<ChannelMessage>,
    },

    PresenceResult {
        req: u64,
        members: Vec<PresenceMessage>,
    },

    /// Live message delivery
    Message { message: ChannelMessage },

    /// Live presence event
    Presence { event: PresenceMessage },

    Pong { timestamp: i64 },
}

impl ClientFrame {
    pub fn frame_type(&self) -> &'static str {
        match self {
            ClientFrame::Auth { .. } => "auth",
            ClientFrame::Publish { .. } => "publish",
            ClientFrame::History { .. } => "history",
            ClientFrame::PresenceEnter { .. } => "presence_enter",
            ClientFrame::PresenceUpdate { .. } => "presence_update",
            ClientFrame::PresenceLeave { .. } => "presence_leave",
            ClientFrame::PresenceGet { .. } => "presence_get",
            ClientFrame::Ping { .. } => "ping",
            ClientFrame::Close { .. } => "close",
        }
    }
}

impl ServerFrame {
    /// Correlation id, for request responses
    pub fn req(&self) -> Option<u64> {
        match self {
            ServerFrame::Ack { req }
            | ServerFrame::Nack { req, .. }
            | ServerFrame::HistoryResult { req, .. }
            | ServerFrame::PresenceResult { req, .. } => Some(*req),
            _ => None,
        }
    }
}

/// Protocol frame with length prefix
#[derive(Debug)]
pub struct Frame {
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame from any protocol message
    pub fn encode<T: Serialize>(message: &T) -> Result<Self> {
        let payload = serde_json::to_vec(message)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(ChatError::Protocol(format!("frame too large: {} bytes", payload.len())));
        }
        Ok(Self {
            length: payload.len() as u32,
            payload,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ChatError::Protocol(format!("Invalid frame: {}", e)))
    }

    /// Serialize frame to bytes (length prefix + payload)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload.len());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse frame from bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }

        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

        if data.len() < 4 + length {
            return None;
        }

        Some(Self {
            length: length as u32,
            payload: data[4..4 + length].to_vec(),
        })
    }
}

/// Write one message as a length-prefixed frame
pub async fn write_frame<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let frame = Frame::encode(message)?;
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ChatError::Io(e)),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(ChatError::Protocol(format!("frame too large: {} bytes", length)));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    let frame = Frame {
        length: length as u32,
        payload,
    };
    frame.decode().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes_roundtrip() {
        let msg = ClientFrame::Ping { timestamp: 12345 };
        let frame = Frame::encode(&msg).unwrap();
        let bytes = frame.to_bytes();
        let parsed = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(frame.length, parsed.length);
        assert_eq!(parsed.decode::<ClientFrame>().unwrap(), msg);
    }

    #[test]
    fn test_partial_frame_is_incomplete() {
        let frame = Frame::encode(&ServerFrame::Ack { req: 7 }).unwrap();
        let bytes = frame.to_bytes();
        assert!(Frame::from_bytes(&bytes[..bytes.len() - 1]).is_none());
        assert!(Frame::from_bytes(&bytes[..3]).is_none());
    }

    #[test]
    fn test_frames_are_tagged_by_type() {
        let json = serde_json::to_value(ClientFrame::History { req: 3, limit: 50 }).unwrap();
        assert_eq!(json["type"], "history");
        assert_eq!(json["limit"], 50);

        let json = serde_json::to_value(ServerFrame::Nack { req: 3, reason: "no".into() }).unwrap();
        assert_eq!(json["type"], "nack");
    }

    #[test]
    fn test_response_correlation() {
        assert_eq!(ServerFrame::Ack { req: 9 }.req(), Some(9));
        assert_eq!(ServerFrame::Pong { timestamp: 1 }.req(), None);
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, &ClientFrame::PresenceGet { req: 1 }).await.unwrap();
        write_frame(&mut client, &ClientFrame::Close { reason: "bye".into() }).await.unwrap();
        drop(client);

        let first: Option<ClientFrame> = read_frame(&mut server).await.unwrap();
        assert_eq!(first, Some(ClientFrame::PresenceGet { req: 1 }));
        let second: Option<ClientFrame> = read_frame(&mut server).await.unwrap();
        assert!(matches!(second, Some(ClientFrame::Close { .. })));
        let end: Option<ClientFrame> = read_frame(&mut server).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let result: Result<Option<ClientFrame>> = read_frame(&mut server).await;
        assert!(matches!(result, Err(ChatError::Protocol(_))));
    }
}
