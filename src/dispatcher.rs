use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::member::MemberId;

/// The seam to the distribution layer: every fully received message is handed over here,
///  in wire order. The transport does not interpret payload bytes; deserialization is the
///  dispatcher's business.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, sender: MemberId, msg_id: u16, direct_ack_requested: bool, payload: Bytes);
}
