#[cfg(test)] use mockall::automock;

use crate::member::MemberId;

/// The tuple the connection table indexes connections by. Carried by the connection so
///  that close can remove exactly the right index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub remote: MemberId,
    pub shared: bool,
    pub preserve_order: bool,
    pub is_receiver: bool,
}

/// Non-owning handle back to the connection table. The table owns connections; a
///  connection only ever asks to be de-indexed.
#[cfg_attr(test, automock)]
pub trait ConnectionRegistry: Send + Sync + 'static {
    fn remove_connection(&self, key: ConnectionKey);
}

/// Registry for connections that are not pooled anywhere (tests, short-lived tools).
pub struct UnpooledRegistry;

impl ConnectionRegistry for UnpooledRegistry {
    fn remove_connection(&self, _key: ConnectionKey) {}
}
