//! Frame codec.
//!
//! Every message on the wire is a single frame:
//!
//! ```text
//! offset  size  field
//! 0       8     magic     (network-identifying constant)
//! 8       12    command   (ASCII, zero-padded)
//! 20      4     length    (little-endian u32, payload byte count)
//! 24      4     checksum  (little-endian u32, first 4 bytes of sha256d(payload))
//! 28      N     payload
//! ```
//!
//! The decoder is resumable: after a frame is dispatched it continues on any
//! trailing bytes already buffered, so multiple frames packed into one TCP
//! segment decode without further socket reads.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use sharepool_core::sha256d;

use crate::config::{MAX_PAYLOAD_SIZE, PROTOCOL_HEAD_LENGTH};
use crate::error::{P2pError, P2pResult};
use crate::protocol::Message;

/// Width of the command field.
const COMMAND_LENGTH: usize = 12;

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A recognised message.
    Message(Message),
    /// A frame with an unknown command; payload discarded, link continues.
    Unknown(String),
}

/// Head fields of a frame whose payload has not arrived yet.
#[derive(Debug)]
struct PendingHead {
    command: String,
    length: usize,
    checksum: u32,
}

/// Codec for magic-prefixed, checksummed frames.
#[derive(Debug)]
pub struct FrameCodec {
    magic: [u8; 8],
    pending: Option<PendingHead>,
}

impl FrameCodec {
    /// Create a codec for the given network magic.
    pub fn new(magic: [u8; 8]) -> Self {
        Self { magic, pending: None }
    }
}

impl Decoder for FrameCodec {
    type Item = Inbound;
    type Error = P2pError;

    fn decode(&mut self, src: &mut BytesMut) -> P2pResult<Option<Inbound>> {
        if self.pending.is_none() {
            if src.len() < PROTOCOL_HEAD_LENGTH {
                return Ok(None);
            }

            let magic: [u8; 8] = src[0..8].try_into().unwrap();
            if magic != self.magic {
                return Err(P2pError::BadMagic {
                    expected: self.magic,
                    actual: magic,
                });
            }

            let command_bytes = &src[8..8 + COMMAND_LENGTH];
            let end = command_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(COMMAND_LENGTH);
            let command = String::from_utf8_lossy(&command_bytes[..end]).into_owned();

            let length = u32::from_le_bytes(src[20..24].try_into().unwrap()) as usize;
            if length > MAX_PAYLOAD_SIZE {
                return Err(P2pError::MessageTooLarge {
                    size: length,
                    max: MAX_PAYLOAD_SIZE,
                });
            }
            let checksum = u32::from_le_bytes(src[24..28].try_into().unwrap());

            src.advance(PROTOCOL_HEAD_LENGTH);
            self.pending = Some(PendingHead { command, length, checksum });
        }

        let head = self.pending.as_ref().unwrap();
        if src.len() < head.length {
            src.reserve(head.length - src.len());
            return Ok(None);
        }

        let head = self.pending.take().unwrap();
        let payload = src.split_to(head.length);

        let computed = u32::from_le_bytes(sha256d(&payload)[0..4].try_into().unwrap());
        if computed != head.checksum {
            return Err(P2pError::BadChecksum {
                expected: head.checksum,
                actual: computed,
            });
        }

        match Message::decode_payload(&head.command, &payload)? {
            Some(message) => Ok(Some(Inbound::Message(message))),
            None => Ok(Some(Inbound::Unknown(head.command))),
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = P2pError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> P2pResult<()> {
        let payload = message.encode_payload();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(P2pError::MessageTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let command = message.command().as_bytes();
        debug_assert!(command.len() <= COMMAND_LENGTH);

        let checksum = u32::from_le_bytes(sha256d(&payload)[0..4].try_into().unwrap());

        dst.reserve(PROTOCOL_HEAD_LENGTH + payload.len());
        dst.put_slice(&self.magic);
        dst.put_slice(command);
        dst.put_bytes(0, COMMAND_LENGTH - command.len());
        dst.put_u32_le(payload.len() as u32);
        dst.put_u32_le(checksum);
        dst.put_slice(&payload);

        Ok(())
    }
}
