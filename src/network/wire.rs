//! Length-prefixed bincode wire protocol.
//!
//! Frame format: [4-byte length (u32 big-endian)][bincode envelope]
//! where the envelope carries the protocol version next to the message.
//! Maximum frame size: 4MB (prevents memory exhaustion attacks).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetworkError;
use crate::network::message::{NetworkMessage, PROTOCOL_VERSION};

/// Maximum allowed frame size (4MB)
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct WireEnvelope {
    version: u32,
    message: NetworkMessage,
}

/// Serialize a NetworkMessage into a length-prefixed, versioned frame.
pub fn serialize_frame(message: &NetworkMessage) -> Result<Vec<u8>, NetworkError> {
    let envelope = WireEnvelope {
        version: PROTOCOL_VERSION,
        message: message.clone(),
    };
    let payload =
        bincode::serialize(&envelope).map_err(|e| NetworkError::Serialization(e.to_string()))?;

    let len = payload.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE as usize,
        });
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one message as a frame and flush.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &NetworkMessage,
) -> Result<usize, NetworkError> {
    let frame = serialize_frame(message)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| NetworkError::Serialization(format!("write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| NetworkError::Serialization(format!("flush failed: {}", e)))?;
    Ok(frame.len())
}

/// Read one frame. Returns Ok(None) on clean EOF (connection closed).
/// A version mismatch or oversized frame is an error the caller treats as
/// a protocol violation.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(NetworkMessage, usize)>, NetworkError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(NetworkError::Serialization(format!(
                "failed to read frame length: {}",
                e
            )))
        }
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: len as usize,
            max: MAX_FRAME_SIZE as usize,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| NetworkError::Serialization(format!("failed to read frame payload: {}", e)))?;

    let envelope: WireEnvelope = bincode::deserialize(&payload)
        .map_err(|e| NetworkError::Serialization(format!("failed to deserialize frame: {}", e)))?;

    if envelope.version != PROTOCOL_VERSION {
        return Err(NetworkError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: envelope.version,
        });
    }

    Ok(Some((envelope.message, 4 + payload.len())))
}
