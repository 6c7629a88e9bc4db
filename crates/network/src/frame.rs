//! Bus wire framing.
//!
//! ```text
//! +--------------------------+
//! | length (u32, big-endian) |  bytes that follow
//! +--------------------------+
//! | version (u8)             |
//! | session_id_len (u16 BE)  |
//! | session_id (utf-8)       |
//! | msg_type (u16 BE)        |
//! | payload                  |
//! +--------------------------+
//! ```
//!
//! The header is enough to route a frame to its subscription; the payload
//! is opaque to the bus.

use threshold_types::MessageType;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetworkError;

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

pub const FRAME_VERSION: u8 = 1;

const HEADER_FIXED: usize = 1 + 2 + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub session_id: String,
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(session_id: impl Into<String>, msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            session_id: session_id.into(),
            msg_type,
            payload,
        }
    }

    /// Encode with length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        let sid = self.session_id.as_bytes();
        if sid.len() > u16::MAX as usize {
            return Err(NetworkError::CodecError(format!(
                "session id too long: {} bytes",
                sid.len()
            )));
        }

        let body_len = HEADER_FIXED + sid.len() + self.payload.len();
        if body_len > MAX_FRAME_SIZE as usize {
            return Err(NetworkError::CodecError(format!(
                "frame too large: {} bytes (max {})",
                body_len, MAX_FRAME_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        buf.push(FRAME_VERSION);
        buf.extend_from_slice(&(sid.len() as u16).to_be_bytes());
        buf.extend_from_slice(sid);
        buf.extend_from_slice(&self.msg_type.code().to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a frame body (without the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self, NetworkError> {
        if body.len() < HEADER_FIXED {
            return Err(NetworkError::CodecError("frame truncated".to_string()));
        }
        if body[0] != FRAME_VERSION {
            return Err(NetworkError::CodecError(format!(
                "unsupported frame version {}",
                body[0]
            )));
        }

        let sid_len = u16::from_be_bytes([body[1], body[2]]) as usize;
        let sid_end = 3 + sid_len;
        if body.len() < sid_end + 2 {
            return Err(NetworkError::CodecError("frame truncated".to_string()));
        }
        let session_id = std::str::from_utf8(&body[3..sid_end])
            .map_err(|e| NetworkError::CodecError(e.to_string()))?
            .to_string();

        let code = u16::from_be_bytes([body[sid_end], body[sid_end + 1]]);
        let msg_type =
            MessageType::try_from(code).map_err(|e| NetworkError::CodecError(e.to_string()))?;

        Ok(Self {
            session_id,
            msg_type,
            payload: body[sid_end + 2..].to_vec(),
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), NetworkError> {
        let encoded = self.encode()?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, NetworkError> {
        let body = read_prefixed(reader).await?;
        Self::decode(&body)
    }
}

/// Read one `u32`-length-prefixed body.
pub(crate) async fn read_prefixed<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, NetworkError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::CodecError(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = Frame::new("8453-100", MessageType::TssReadyMsg, vec![0xaa, 0xbb]);
        let encoded = frame.encode().unwrap();

        let body_len = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        assert_eq!(body_len, encoded.len() - 4);
        assert_eq!(encoded[4], FRAME_VERSION);
        assert_eq!(u16::from_be_bytes([encoded[5], encoded[6]]), 8);
        assert_eq!(&encoded[7..15], b"8453-100");
        assert_eq!(u16::from_be_bytes([encoded[15], encoded[16]]), 5);
        assert_eq!(&encoded[17..], &[0xaa, 0xbb]);

        // Skip length prefix
        assert_eq!(Frame::decode(&encoded[4..]).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(Frame::decode(&[]).is_err());
        assert!(Frame::decode(&[2, 0, 0, 0, 1]).is_err());
        // Unknown message type 999
        assert!(Frame::decode(&[1, 0, 0, 0x03, 0xe7]).is_err());
        // Session id length beyond body
        assert!(Frame::decode(&[1, 0, 10, b'a']).is_err());
    }

    #[test]
    fn test_empty_session_and_payload() {
        let frame = Frame::new("", MessageType::CoordinatorPingMsg, vec![]);
        let encoded = frame.encode().unwrap();
        assert_eq!(Frame::decode(&encoded[4..]).unwrap(), frame);
    }

    #[tokio::test]
    async fn test_async_read_write() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::new("s", MessageType::SignatureMsg, vec![1u8; 65]);
        frame.write_to(&mut a).await.unwrap();
        assert_eq!(Frame::read_from(&mut b).await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_prefix() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes()).await.unwrap();
        assert!(matches!(
            Frame::read_from(&mut b).await,
            Err(NetworkError::CodecError(_))
        ));
    }
}
