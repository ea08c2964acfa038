use crate::protocol::error::{MorayError, Result};
use crate::protocol::Message;

/// Largest frame accepted on the wire (100 MB).
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// JSON codec for protocol frames.
///
/// # Example
///
/// ```
/// use moray_common::transport::JsonCodec;
/// use moray_common::Message;
///
/// let frame = Message::end(1, "ping");
/// let bytes = JsonCodec::encode_frame(&frame).unwrap();
/// let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
/// assert_eq!(len, bytes.len() - 4);
///
/// let decoded = JsonCodec::decode_message(&bytes[4..]).unwrap();
/// assert_eq!(decoded.id, 1);
/// ```
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a frame body to JSON bytes
    pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(message)?)
    }

    /// Decode a frame body from JSON bytes
    ///
    /// A body that is not a valid frame is a protocol violation by the peer,
    /// not a local serialization problem.
    pub fn decode_message(data: &[u8]) -> Result<Message> {
        serde_json::from_slice(data)
            .map_err(|e| MorayError::Protocol(format!("undecodable frame: {}", e)))
    }

    /// Encode a frame body and prepend its length prefix
    ///
    /// # Errors
    ///
    /// Returns an error if the encoded body exceeds [`MAX_MESSAGE_SIZE`]
    pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
        let body = Self::encode_message(message)?;
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(MorayError::InvalidArgument(format!(
                "Message too large: {} bytes (max {} bytes)",
                body.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let mut frame = Vec::with_capacity(body.len() + 4);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}
