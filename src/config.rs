use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;

use crate::msg_header::MAX_MSG_SIZE;

/// How long a sender waits for the handshake reply before giving up on this attempt.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(59000);
/// Pause between connect attempts while the remote is still in the membership view.
pub const RECONNECT_WAIT_TIME: Duration = Duration::from_millis(2000);
/// Initial receive buffer capacity; the buffer grows on demand up to one full frame.
pub const SMALL_BUFFER_SIZE: usize = 4096;
/// Upper bound for the doubling wait in polling loops (waiting for membership to drop a
///  force-removed peer, waiting for a pusher to hand over).
pub const MAX_WAIT_TIME: Duration = Duration::from_millis(32);

/// TLS material for the transport: one server config for accepted sockets, one client config
///  for initiated ones. Peers are addressed by IP, so certificate verification has to accept
///  IP SANs (or be replaced wholesale for clusters with their own trust scheme).
#[derive(Clone)]
pub struct TlsConfig {
    pub server: Arc<rustls::ServerConfig>,
    pub client: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TlsConfig")
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// The membership layer's failure detection timeout. The TCP connect timeout is derived
    ///  from this (6x) unless overridden explicitly.
    pub member_timeout: Duration,
    pub connect_timeout_override: Option<Duration>,

    pub handshake_timeout: Duration,
    pub reconnect_wait: Duration,

    /// Zero disables async mode: senders then always block on the socket. Nonzero is the
    ///  grace a producer gives a non-draining socket before tripping over into the queue.
    pub async_distribution_timeout: Duration,
    /// How long the pusher tolerates a single blocked write before evicting the receiver.
    pub async_queue_timeout: Duration,
    /// Byte ceiling for the outgoing queue; crossing it evicts the receiver.
    pub async_max_queue_size: u64,

    pub ack_wait_threshold: Duration,
    /// Zero disables severe-alert escalation.
    pub ack_severe_alert_threshold: Duration,

    pub idle_connection_timeout: Duration,
    /// Granularity of the shared timeout scheduler.
    pub timeout_check_interval: Duration,

    /// Send-side chunking threshold. Payloads above this are carried as a chunk series.
    pub max_frame_payload: usize,
    /// Ceiling for reassembling a chunk series on the receiver.
    pub max_assembled_size: usize,

    pub socket_buffer_size: usize,

    pub tls: Option<TlsConfig>,
    /// Gates the post-reply membership check in the receiver handshake.
    pub require_peer_authentication: bool,
    pub enable_network_partition_detection: bool,
    /// Whether peers that announce thread-owned sockets make our own outbound sends
    ///  thread-owned as well (bounded by the chain depth carried in the handshake).
    pub thread_owned_sockets_dominate: bool,
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        TransportConfig {
            member_timeout: Duration::from_secs(5),
            connect_timeout_override: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            reconnect_wait: RECONNECT_WAIT_TIME,
            async_distribution_timeout: Duration::ZERO,
            async_queue_timeout: Duration::from_secs(60),
            async_max_queue_size: 4 * 1024 * 1024,
            ack_wait_threshold: Duration::from_secs(15),
            ack_severe_alert_threshold: Duration::ZERO,
            idle_connection_timeout: Duration::from_millis(2 * 59000),
            timeout_check_interval: Duration::from_secs(1),
            max_frame_payload: MAX_MSG_SIZE as usize,
            max_assembled_size: 64 * 1024 * 1024,
            socket_buffer_size: SMALL_BUFFER_SIZE,
            tls: None,
            require_peer_authentication: false,
            enable_network_partition_detection: false,
            thread_owned_sockets_dominate: false,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_override.unwrap_or(6 * self.member_timeout)
    }

    pub fn async_mode_configured(&self) -> bool {
        !self.async_distribution_timeout.is_zero()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.member_timeout.is_zero() {
            bail!("member timeout must be nonzero");
        }
        if self.max_frame_payload > MAX_MSG_SIZE as usize {
            bail!("max frame payload {} exceeds the wire format limit of {}", self.max_frame_payload, MAX_MSG_SIZE);
        }
        if self.max_frame_payload == 0 {
            bail!("max frame payload must be nonzero");
        }
        if self.async_mode_configured() && self.async_max_queue_size == 0 {
            bail!("async mode is configured but the queue size ceiling is zero");
        }
        if self.timeout_check_interval.is_zero() {
            bail!("timeout check interval must be nonzero");
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(TransportConfig::new().validate().is_ok());
    }

    #[test]
    fn test_connect_timeout_is_six_member_timeouts() {
        let mut config = TransportConfig::new();
        config.member_timeout = Duration::from_secs(3);
        assert_eq!(config.connect_timeout(), Duration::from_secs(18));

        config.connect_timeout_override = Some(Duration::from_secs(1));
        assert_eq!(config.connect_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_oversized_frame_payload() {
        let mut config = TransportConfig::new();
        config.max_frame_payload = MAX_MSG_SIZE as usize + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_async_without_ceiling() {
        let mut config = TransportConfig::new();
        config.async_distribution_timeout = Duration::from_millis(1);
        config.async_max_queue_size = 0;
        assert!(config.validate().is_err());
    }
}
