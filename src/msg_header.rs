use bytes::{Buf, BufMut};
use num_enum::TryFromPrimitive;

use crate::error::ConnectionError;

/// Payload length is carried in the low 24 bits of the first header word.
pub const MAX_MSG_SIZE: u32 = 0x00ff_ffff;
/// The high byte of the first header word carries the handshake version so that a peer
///  from an incompatible release is rejected on the very first frame.
pub const HANDSHAKE_VERSION: u8 = 7;
/// Set in the type byte when the sender expects the reply on this same socket.
pub const DIRECT_ACK_BIT: u8 = 0x20;
/// Message id for messages that are not part of a chunk series and expect no reply.
pub const NO_MSG_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MsgType {
    /// a complete message in a single frame
    Normal = 0x4c,
    /// one chunk of a multi-frame message
    Chunk = 0x4d,
    /// the last chunk of a multi-frame message
    EndChunk = 0x4e,
}

/// The fixed 7-byte frame header: 4 bytes version+length, 1 byte type (with the direct-ack
///  bit), 2 bytes message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub payload_len: u32,
    pub msg_type: MsgType,
    pub direct_ack: bool,
    pub msg_id: u16,
}

impl MsgHeader {
    pub const SERIALIZED_LEN: usize = 7;

    pub fn for_payload(payload_len: usize, msg_type: MsgType, direct_ack: bool, msg_id: u16) -> Result<MsgHeader, ConnectionError> {
        if payload_len > MAX_MSG_SIZE as usize {
            return Err(ConnectionError::MessageTooLarge { size: payload_len, max: MAX_MSG_SIZE });
        }
        Ok(MsgHeader {
            // in range: just checked against the 24-bit limit
            payload_len: payload_len as u32,
            msg_type,
            direct_ack,
            msg_id,
        })
    }

    /// Total size of the frame this header starts, header bytes included. The 24-bit
    ///  length field keeps this lossless as a `usize`.
    pub fn frame_len(&self) -> usize {
        Self::SERIALIZED_LEN + self.payload_len as usize
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.payload_len <= MAX_MSG_SIZE);
        buf.put_u32(self.payload_len | (HANDSHAKE_VERSION as u32) << 24);

        let mut type_byte = self.msg_type as u8;
        if self.direct_ack {
            type_byte |= DIRECT_ACK_BIT;
        }
        buf.put_u8(type_byte);
        buf.put_u16(self.msg_id);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<MsgHeader, ConnectionError> {
        let word = buf.try_get_u32().map_err(|_| ConnectionError::Truncated)?;

        let version = (word >> 24) as u8;
        if version != HANDSHAKE_VERSION {
            return Err(ConnectionError::VersionMismatch { expected: HANDSHAKE_VERSION, actual: version });
        }
        let payload_len = word & MAX_MSG_SIZE;

        let type_byte = buf.try_get_u8().map_err(|_| ConnectionError::Truncated)?;
        let msg_type = MsgType::try_from(type_byte & !DIRECT_ACK_BIT)
            .map_err(|_| ConnectionError::UnknownMessageType(type_byte))?;
        let direct_ack = type_byte & DIRECT_ACK_BIT != 0;

        let msg_id = buf.try_get_u16().map_err(|_| ConnectionError::Truncated)?;

        Ok(MsgHeader {
            payload_len,
            msg_type,
            direct_ack,
            msg_id,
        })
    }
}
