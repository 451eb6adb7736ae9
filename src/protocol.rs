//! Control protocol between the daemon and a session worker
//!
//! Length-prefixed binary frames:
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────────────┐
//! │   Length   │  Message ID  │  Payload (bincode)   │
//! │  (4 bytes) │  (4 bytes)   │  (variable length)   │
//! └────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! The length covers the message id and the payload.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Maximum message size (1MB; control frames are small)
const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Message ID type (the addressed client stream, 0 for the daemon itself)
pub type MessageId = u32;

/// Correlation id of a liveness ping
pub type PingId = u64;

/// Control messages exchanged with a session worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Daemon asks the worker to prove it is alive
    Ping { id: PingId },
    /// Worker answers a ping
    PingReply { id: PingId },
    /// Arm or disarm the worker-side shutdown timer
    ShutdownTimer {
        delay_secs: u64,
        enable: bool,
    },
    /// New inflate factor (per-mille)
    Inflate { factor: i32 },
    /// Worker reports a status change
    Status { code: i32 },
    /// Opaque staged payload (start message, query number, requirements)
    Payload { kind: PayloadKind, bytes: Vec<u8> },
}

/// Which staged buffer a payload frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    QueryNum,
    StartMsg,
    Requirements,
}

/// Encode a message into the wire format
pub fn encode_message(message: &Message, message_id: MessageId) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let payload_len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Message too large: {} bytes", payload.len()),
            )
        })?;

    let mut buffer = Vec::with_capacity(payload.len() + 8);
    buffer.extend_from_slice(&(payload_len + 4).to_le_bytes());
    buffer.extend_from_slice(&message_id.to_le_bytes());
    buffer.extend_from_slice(&payload);

    Ok(buffer)
}

/// Decode one message from a reader
///
/// Returns (message, message_id)
pub fn decode_message<R: Read>(reader: &mut R) -> io::Result<(Message, MessageId)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let frame_len = u32::from_le_bytes(len_bytes);

    if frame_len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Message length too small",
        ));
    }
    if frame_len - 4 > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", frame_len),
        ));
    }

    let mut id_bytes = [0u8; 4];
    reader.read_exact(&mut id_bytes)?;
    let message_id = u32::from_le_bytes(id_bytes);

    let mut payload = vec![0u8; (frame_len - 4) as usize];
    reader.read_exact(&mut payload)?;

    let message: Message = bincode::deserialize(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok((message, message_id))
}

/// Write a message to a stream
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &Message,
    message_id: MessageId,
) -> io::Result<()> {
    let bytes = encode_message(message, message_id)?;
    writer.write_all(&bytes)?;
    writer.flush()
}

/// Read a message from a stream
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<(Message, MessageId)> {
    decode_message(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_decode_ping() {
        let encoded = encode_message(&Message::Ping { id: 77 }, 0).unwrap();
        let mut cursor = Cursor::new(encoded);
        let (decoded, id) = decode_message(&mut cursor).unwrap();

        assert_eq!(decoded, Message::Ping { id: 77 });
        assert_eq!(id, 0);
    }

    #[test]
    fn test_frame_length_prefix() {
        let encoded = encode_message(&Message::Inflate { factor: 1500 }, 3).unwrap();
        let len = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len() - 4);
        assert_eq!(&encoded[4..8], &3u32.to_le_bytes());
    }

    #[test]
    fn test_multiple_messages_on_one_stream() {
        let mut wire = Vec::new();
        write_message(&mut wire, &Message::ShutdownTimer { delay_secs: 30, enable: true }, 1)
            .unwrap();
        write_message(&mut wire, &Message::PingReply { id: 5 }, 2).unwrap();

        let mut cursor = Cursor::new(wire);
        let (first, first_id) = read_message(&mut cursor).unwrap();
        let (second, second_id) = read_message(&mut cursor).unwrap();

        assert_eq!(first, Message::ShutdownTimer { delay_secs: 30, enable: true });
        assert_eq!(first_id, 1);
        assert_eq!(second, Message::PingReply { id: 5 });
        assert_eq!(second_id, 2);
    }

    #[test]
    fn test_decode_invalid_length() {
        let mut cursor = Cursor::new(vec![2u8, 0, 0, 0]);
        let err = decode_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decode_truncated_frame() {
        let mut encoded = encode_message(&Message::Status { code: 1 }, 9).unwrap();
        encoded.truncate(encoded.len() - 1);
        let mut cursor = Cursor::new(encoded);
        assert!(decode_message(&mut cursor).is_err());
    }
}
