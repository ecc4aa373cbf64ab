use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::member::MemberId;

/// The transport's view onto the membership service. Connections only ever hold an opaque
///  handle to this; the membership implementation lives elsewhere and owns nothing of the
///  connection's state.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipService: Send + Sync + 'static {
    fn is_member(&self, member: MemberId) -> bool;

    /// true if the local node has decided the remote is gone and rejects its traffic
    fn is_shunned(&self, member: MemberId) -> bool;

    fn shutdown_in_progress(&self) -> bool;

    /// start a failure-detection probe against the remote
    async fn suspect_member(&self, member: MemberId, reason: String);

    /// ask the coordinator to remove the remote from the view
    async fn request_member_removal(&self, member: MemberId, reason: String);

    /// Make an accepted peer visible that the view does not know yet. Idempotent.
    ///  Returns false if the peer must be rejected (it is shunned).
    async fn register_surprise_member(&self, member: MemberId) -> bool;

    /// Wait until peer authentication has cleared the remote; false means it did not
    ///  clear within the membership layer's own timeout.
    async fn await_membership_check(&self, member: MemberId) -> bool;
}

/// Observed at every suspension point; when cancellation is in progress all I/O returns
///  and the connection closes without further reporting.
#[cfg_attr(test, automock)]
pub trait CancelCriterion: Send + Sync + 'static {
    fn cancel_in_progress(&self) -> Option<String>;
}

/// A cancel criterion for tests and tools that never fires.
pub struct NeverCancelled;

impl CancelCriterion for NeverCancelled {
    fn cancel_in_progress(&self) -> Option<String> {
        None
    }
}
