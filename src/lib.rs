//! A peer-to-peer framed TCP transport between cluster members.
//!
//! One [`Connection`] binds a pair of members across one TCP socket: a framed message
//! stream with a handshake, ordered or unordered semantics chosen per connection,
//! optional TLS, a backpressure model that trips over from blocking writes into an
//! asynchronously flushed queue with slow-receiver eviction, chunked reassembly of large
//! messages, a direct-ack reply path, and timeout/suspicion signalling.
//!
//! The membership service, the message dispatcher and the connection table are external
//! collaborators, reached through the traits in [`membership`], [`dispatcher`] and
//! [`registry`].

pub mod buffers;
pub mod chunk_assembler;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod io_filter;
pub mod member;
pub mod membership;
pub mod msg_header;
mod outgoing_queue;
mod reader;
pub mod registry;
pub mod stats;
pub mod timers;

pub use config::TransportConfig;
pub use connection::{Collaborators, Connection, ConnectionState, SendOptions, SenderContext};
pub use error::ConnectionError;
pub use member::MemberId;
pub use outgoing_queue::ConflationKey;
pub use stats::ConnectionStats;
pub use timers::{AckConnectionGroup, TransportScheduler};

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
