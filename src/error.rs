use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::member::MemberId;

/// Everything that can go wrong on a connection, split the way callers need to react:
///  protocol violations close without retry, transient I/O feeds the reconnect loop,
///  slow-receiver eviction and cancellation terminate, and a blocked direct reply is
///  distinguishable from a dead socket.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("message of {size} bytes exceeds the maximum message size of {max}")]
    MessageTooLarge { size: usize, max: u32 },

    #[error("peer uses handshake version {actual}, this node requires version {expected}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("frame or handshake truncated on the wire")]
    Truncated,

    #[error("malformed handshake: {0}")]
    BadHandshake(String),

    #[error("no handshake reply from {0} within the handshake timeout")]
    HandshakeTimeout(SocketAddr),

    #[error("TLS authentication with {addr} failed: {reason}")]
    TlsAuthentication { addr: SocketAddr, reason: String },

    #[error("chunked message {msg_id} grew to {size} bytes, over the reassembly limit of {max}")]
    ReassemblyOverflow { msg_id: u16, size: usize, max: usize },

    #[error("not connected to {0:?}")]
    NotConnected(MemberId),

    #[error("forced disconnect sent to {0:?}")]
    ForcedDisconnect(MemberId),

    #[error("member {0:?} has left the membership view")]
    MemberLeft(MemberId),

    #[error("timed out reading a direct reply")]
    ReplyTimeout,

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Errors that terminate the sender-side reconnect loop immediately. Everything else is
    ///  retried while the remote is still in the membership view.
    pub fn is_fatal_for_connect(&self) -> bool {
        matches!(
            self,
            ConnectionError::TlsAuthentication { .. }
                | ConnectionError::MemberLeft(_)
                | ConnectionError::Cancelled(_)
        )
    }
}
