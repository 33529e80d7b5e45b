//! RPC frame format.
//!
//! Every unary call is one frame each way over TCP: a 4-byte big-endian length
//! header followed by a JSON body.

use courier_types::error::CourierError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors from the frame layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),
}

impl From<WireError> for CourierError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(io) => CourierError::Connection(io.to_string()),
            WireError::Json(json) => CourierError::Serialization(json.to_string()),
            WireError::ConnectionClosed => CourierError::Connection("connection closed".to_string()),
            other => CourierError::Transport(other.to_string()),
        }
    }
}

/// One frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFrame {
    /// Call id; a reply carries the id of its call.
    pub id: String,
    #[serde(flatten)]
    pub kind: RpcFrameKind,
}

/// Frame variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcFrameKind {
    /// Request call; answered by `Reply`.
    #[serde(rename = "handle_request")]
    HandleRequest(RpcEnvelope),
    /// Notification call; answered by `Ack`.
    #[serde(rename = "handle_notification")]
    HandleNotification(RpcEnvelope),
    /// Serialized response envelope.
    #[serde(rename = "reply")]
    Reply { body: String },
    #[serde(rename = "ack")]
    Ack,
    /// The call could not be processed at all.
    #[serde(rename = "error")]
    Error { code: i32, message: String },
}

/// Body of a call: the JSON message and its canonical type name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub body: String,
    #[serde(rename = "typeName")]
    pub type_name: String,
}

impl RpcFrame {
    pub fn new(kind: RpcFrameKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
        }
    }

    pub fn reply_to(&self, kind: RpcFrameKind) -> Self {
        Self {
            id: self.id.clone(),
            kind,
        }
    }
}

/// Encode a frame (4-byte big-endian length + JSON).
pub fn encode_frame(frame: &RpcFrame) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(frame)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

pub fn decode_frame(body: &[u8]) -> Result<RpcFrame, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, frame: &RpcFrame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, rejecting bodies larger than `max_size`.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<RpcFrame, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header) as usize;
    if len > max_size {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(decode_frame(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let frame = RpcFrame {
            id: "call-1".to_string(),
            kind: RpcFrameKind::HandleRequest(RpcEnvelope {
                body: r#"{"a":1}"#.to_string(),
                type_name: "svc.Math_Add".to_string(),
            }),
        };
        let bytes = encode_frame(&frame).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded = decode_frame(&bytes[4..]).unwrap();
        assert_eq!(decoded.id, "call-1");
        match decoded.kind {
            RpcFrameKind::HandleRequest(env) => assert_eq!(env.type_name, "svc.Math_Add"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_json_shape() {
        let frame = RpcFrame {
            id: "n-1".to_string(),
            kind: RpcFrameKind::HandleNotification(RpcEnvelope {
                body: "{}".to_string(),
                type_name: "svc.Shop_OrderCreated".to_string(),
            }),
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "handle_notification");
        assert_eq!(json["typeName"], "svc.Shop_OrderCreated");
        assert_eq!(json["id"], "n-1");
    }

    #[tokio::test]
    async fn test_stream_round_trip_and_size_limit() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = RpcFrame::new(RpcFrameKind::Ack);
        write_frame(&mut client, &frame).await.unwrap();
        let read = read_frame(&mut server, MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(read.id, frame.id);
        assert!(matches!(read.kind, RpcFrameKind::Ack));

        let big = RpcFrame::new(RpcFrameKind::Reply {
            body: "x".repeat(200),
        });
        write_frame(&mut client, &big).await.unwrap();
        let err = read_frame(&mut server, 64).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { max: 64, .. }));
    }

    #[tokio::test]
    async fn test_write_emits_length_prefix() {
        let frame = RpcFrame::new(RpcFrameKind::Ack);
        let expected = encode_frame(&frame).unwrap();
        let mut writer = tokio_test::io::Builder::new().write(&expected).build();
        write_frame(&mut writer, &frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let bytes = encode_frame(&RpcFrame::new(RpcFrameKind::Ack)).unwrap();
        let mut reader = tokio_test::io::Builder::new().read(&bytes[..bytes.len() - 3]).build();
        let err = read_frame(&mut reader, MAX_FRAME_SIZE).await.unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_frame(&mut server, MAX_FRAME_SIZE).await.unwrap_err();
        assert!(matches!(err, WireError::ConnectionClosed));
    }
}
