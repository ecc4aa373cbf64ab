use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::error::ConnectionError;
use crate::member::MemberId;
use crate::msg_header::HANDSHAKE_VERSION;

pub const REPLY_CODE_OK: u8 = 0x45;
pub const REPLY_CODE_OK_WITH_ASYNC_INFO: u8 = 0x46;

/// Ordinal of the wire-compatibility version this build speaks, exchanged in both
///  handshake directions so either side can accommodate an older peer.
pub const VERSION_ORDINAL: u16 = 1;

/// What a sender announces about itself before anything else goes over the socket.
///
/// The leading zero byte rejects any client that is not a cluster peer (every other
///  protocol a port scanner might speak starts differently), and the version byte
///  rejects peers from incompatible releases before we try to deserialize anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    pub member: MemberId,
    pub shared_resource: bool,
    pub preserve_order: bool,
    pub unique_id: i64,
    pub version_ordinal: u16,
    /// how many hops of thread-owned receivers led to this outbound socket
    pub owned_chain_depth: i32,
}

impl Preamble {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(0);
        buf.put_u8(HANDSHAKE_VERSION);
        self.member.ser(buf);
        buf.put_u8(self.shared_resource as u8);
        buf.put_u8(self.preserve_order as u8);
        buf.put_i64(self.unique_id);
        buf.put_u16_varint(self.version_ordinal);
        buf.put_i32(self.owned_chain_depth);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Preamble, ConnectionError> {
        let initial = buf.try_get_u8().map_err(|_| ConnectionError::Truncated)?;
        if initial != 0 {
            return Err(ConnectionError::BadHandshake(format!(
                "initial byte 0x{:02x} - not a cluster peer", initial
            )));
        }

        let version = buf.try_get_u8().map_err(|_| ConnectionError::Truncated)?;
        if version != HANDSHAKE_VERSION {
            return Err(ConnectionError::VersionMismatch { expected: HANDSHAKE_VERSION, actual: version });
        }

        let member = MemberId::deser(buf)
            .map_err(|e| ConnectionError::BadHandshake(format!("unreadable member identity: {}", e)))?;

        let shared_resource = read_bool(buf)?;
        let preserve_order = read_bool(buf)?;
        let unique_id = buf.try_get_i64().map_err(|_| ConnectionError::Truncated)?;
        let version_ordinal = buf.try_get_u16_varint().map_err(|_| ConnectionError::Truncated)?;
        let owned_chain_depth = buf.try_get_i32().map_err(|_| ConnectionError::Truncated)?;

        Ok(Preamble {
            member,
            shared_resource,
            preserve_order,
            unique_id,
            version_ordinal,
            owned_chain_depth,
        })
    }
}

fn read_bool(buf: &mut impl Buf) -> Result<bool, ConnectionError> {
    match buf.try_get_u8().map_err(|_| ConnectionError::Truncated)? {
        0 => Ok(false),
        1 => Ok(true),
        n => Err(ConnectionError::BadHandshake(format!("invalid bool encoding {}", n))),
    }
}

/// The receiver's answer to a preamble. A receiver that runs with async queuing publishes
///  its parameters so the sender can adopt them; everybody else sends the bare code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeReply {
    Ok,
    OkWithAsyncInfo {
        async_distribution_timeout_millis: i32,
        async_queue_timeout_millis: i32,
        async_max_queue_size: i32,
        version_ordinal: u16,
    },
}

impl HandshakeReply {
    pub fn ser(&self, buf: &mut impl BufMut) {
        match *self {
            HandshakeReply::Ok => {
                buf.put_u8(REPLY_CODE_OK);
            }
            HandshakeReply::OkWithAsyncInfo {
                async_distribution_timeout_millis,
                async_queue_timeout_millis,
                async_max_queue_size,
                version_ordinal,
            } => {
                buf.put_u8(REPLY_CODE_OK_WITH_ASYNC_INFO);
                buf.put_i32(async_distribution_timeout_millis);
                buf.put_i32(async_queue_timeout_millis);
                buf.put_i32(async_max_queue_size);
                buf.put_u16_varint(version_ordinal);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<HandshakeReply, ConnectionError> {
        match buf.try_get_u8().map_err(|_| ConnectionError::Truncated)? {
            REPLY_CODE_OK => Ok(HandshakeReply::Ok),
            REPLY_CODE_OK_WITH_ASYNC_INFO => {
                let async_distribution_timeout_millis = buf.try_get_i32().map_err(|_| ConnectionError::Truncated)?;
                let async_queue_timeout_millis = buf.try_get_i32().map_err(|_| ConnectionError::Truncated)?;
                let async_max_queue_size = buf.try_get_i32().map_err(|_| ConnectionError::Truncated)?;
                let version_ordinal = buf.try_get_u16_varint().map_err(|_| ConnectionError::Truncated)?;
                Ok(HandshakeReply::OkWithAsyncInfo {
                    async_distribution_timeout_millis,
                    async_queue_timeout_millis,
                    async_max_queue_size,
                    version_ordinal,
                })
            }
            n => Err(ConnectionError::BadHandshake(format!("invalid handshake reply code 0x{:02x}", n))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn preamble() -> Preamble {
        Preamble {
            member: MemberId { unique: 12345, socket_addr: "10.0.0.4:7001".parse().unwrap() },
            shared_resource: true,
            preserve_order: true,
            unique_id: 42,
            version_ordinal: 115,
            owned_chain_depth: 0,
        }
    }

    #[rstest]
    #[case::shared_ordered(true, true)]
    #[case::owned_ordered(false, true)]
    #[case::shared_unordered(true, false)]
    fn test_preamble_ser_deser(#[case] shared: bool, #[case] ordered: bool) {
        let original = Preamble {
            shared_resource: shared,
            preserve_order: ordered,
            ..preamble()
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        let deser = Preamble::deser(&mut buf).unwrap();
        assert_eq!(deser, original);
    }

    #[test]
    fn test_preamble_rejects_nonzero_initial_byte() {
        let mut buf = BytesMut::new();
        preamble().ser(&mut buf);
        buf[0] = 0x16; // a TLS client hello, say

        assert!(matches!(Preamble::deser(&mut buf), Err(ConnectionError::BadHandshake(_))));
    }

    #[test]
    fn test_preamble_rejects_wrong_version() {
        let mut buf = BytesMut::new();
        preamble().ser(&mut buf);
        buf[1] = 6;

        assert!(matches!(
            Preamble::deser(&mut buf),
            Err(ConnectionError::VersionMismatch { expected: HANDSHAKE_VERSION, actual: 6 })
        ));
    }

    #[test]
    fn test_preamble_truncated() {
        let mut buf = BytesMut::new();
        preamble().ser(&mut buf);
        let len = buf.len();
        let mut truncated = &buf[..len - 3];

        assert!(matches!(Preamble::deser(&mut truncated), Err(ConnectionError::Truncated)));
    }

    #[rstest]
    #[case::plain(HandshakeReply::Ok)]
    #[case::with_async_info(HandshakeReply::OkWithAsyncInfo {
        async_distribution_timeout_millis: 5,
        async_queue_timeout_millis: 60_000,
        async_max_queue_size: 4 * 1024 * 1024,
        version_ordinal: 115,
    })]
    fn test_reply_ser_deser(#[case] original: HandshakeReply) {
        let mut buf = BytesMut::new();
        original.ser(&mut buf);

        if original == HandshakeReply::Ok {
            assert_eq!(buf.len(), 1);
        }

        let deser = HandshakeReply::deser(&mut buf).unwrap();
        assert_eq!(deser, original);
    }

    #[test]
    fn test_reply_rejects_unknown_code() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x47);
        assert!(matches!(HandshakeReply::deser(&mut buf), Err(ConnectionError::BadHandshake(_))));
    }
}
