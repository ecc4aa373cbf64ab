#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use p2p_transport::dispatcher::MessageDispatcher;
use p2p_transport::handshake::{HandshakeReply, Preamble};
use p2p_transport::membership::{CancelCriterion, MembershipService};
use p2p_transport::msg_header::{MsgHeader, MsgType};
use p2p_transport::registry::{ConnectionKey, ConnectionRegistry};
use p2p_transport::{Collaborators, ConnectionStats, MemberId, TransportConfig};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();
}

pub fn member(unique: u64, addr: &str) -> MemberId {
    MemberId {
        unique,
        socket_addr: addr.parse().unwrap(),
    }
}

pub fn member_at(unique: u64, socket_addr: SocketAddr) -> MemberId {
    MemberId { unique, socket_addr }
}

/// A config with all timeouts tightened so scenario tests run in milliseconds.
pub fn fast_config() -> TransportConfig {
    let mut config = TransportConfig::new();
    config.member_timeout = Duration::from_millis(500);
    config.handshake_timeout = Duration::from_secs(5);
    config.reconnect_wait = Duration::from_millis(10);
    config.timeout_check_interval = Duration::from_millis(10);
    config.idle_connection_timeout = Duration::from_secs(60);
    config
}

pub struct TestMembership {
    members: Mutex<HashSet<MemberId>>,
    shunned: Mutex<HashSet<MemberId>>,
    pub suspects: Mutex<Vec<(MemberId, String)>>,
    pub removals: Mutex<Vec<(MemberId, String)>>,
    pub surprises: Mutex<Vec<MemberId>>,
}

impl TestMembership {
    pub fn new(members: &[MemberId]) -> Arc<TestMembership> {
        Arc::new(TestMembership {
            members: Mutex::new(members.iter().copied().collect()),
            shunned: Mutex::new(HashSet::new()),
            suspects: Mutex::new(Vec::new()),
            removals: Mutex::new(Vec::new()),
            surprises: Mutex::new(Vec::new()),
        })
    }

    pub fn drop_member(&self, member: MemberId) {
        self.members.lock().unwrap().remove(&member);
    }

    pub fn contains(&self, member: MemberId) -> bool {
        self.members.lock().unwrap().contains(&member)
    }

    pub fn shun(&self, member: MemberId) {
        self.shunned.lock().unwrap().insert(member);
    }

    pub fn num_suspects(&self) -> usize {
        self.suspects.lock().unwrap().len()
    }

    pub fn num_removals(&self) -> usize {
        self.removals.lock().unwrap().len()
    }

    pub fn num_surprises(&self) -> usize {
        self.surprises.lock().unwrap().len()
    }
}

#[async_trait]
impl MembershipService for TestMembership {
    fn is_member(&self, member: MemberId) -> bool {
        self.members.lock().unwrap().contains(&member)
    }

    fn is_shunned(&self, member: MemberId) -> bool {
        self.shunned.lock().unwrap().contains(&member)
    }

    fn shutdown_in_progress(&self) -> bool {
        false
    }

    async fn suspect_member(&self, member: MemberId, reason: String) {
        self.suspects.lock().unwrap().push((member, reason));
    }

    async fn request_member_removal(&self, member: MemberId, reason: String) {
        self.members.lock().unwrap().remove(&member);
        self.removals.lock().unwrap().push((member, reason));
    }

    async fn register_surprise_member(&self, member: MemberId) -> bool {
        if self.is_shunned(member) {
            return false;
        }
        self.surprises.lock().unwrap().push(member);
        self.members.lock().unwrap().insert(member);
        true
    }

    async fn await_membership_check(&self, member: MemberId) -> bool {
        self.is_member(member)
    }
}

pub struct TestDispatcher {
    pub messages: Mutex<Vec<(MemberId, u16, bool, Bytes)>>,
}

impl TestDispatcher {
    pub fn new() -> Arc<TestDispatcher> {
        Arc::new(TestDispatcher {
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn num_messages(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.messages.lock().unwrap().iter().map(|(_, _, _, p)| p.to_vec()).collect()
    }
}

#[async_trait]
impl MessageDispatcher for TestDispatcher {
    async fn on_message(&self, sender: MemberId, msg_id: u16, direct_ack_requested: bool, payload: Bytes) {
        self.messages.lock().unwrap().push((sender, msg_id, direct_ack_requested, payload));
    }
}

pub struct TestRegistry {
    pub removed: Mutex<Vec<ConnectionKey>>,
}

impl TestRegistry {
    pub fn new() -> Arc<TestRegistry> {
        Arc::new(TestRegistry {
            removed: Mutex::new(Vec::new()),
        })
    }

    pub fn num_removed(&self) -> usize {
        self.removed.lock().unwrap().len()
    }
}

impl ConnectionRegistry for TestRegistry {
    fn remove_connection(&self, key: ConnectionKey) {
        self.removed.lock().unwrap().push(key);
    }
}

pub struct TestCancel;
impl CancelCriterion for TestCancel {
    fn cancel_in_progress(&self) -> Option<String> {
        None
    }
}

pub struct TestEnv {
    pub membership: Arc<TestMembership>,
    pub dispatcher: Arc<TestDispatcher>,
    pub registry: Arc<TestRegistry>,
    pub stats: Arc<ConnectionStats>,
}

impl TestEnv {
    pub fn new(members: &[MemberId]) -> TestEnv {
        TestEnv {
            membership: TestMembership::new(members),
            dispatcher: TestDispatcher::new(),
            registry: TestRegistry::new(),
            stats: Arc::new(ConnectionStats::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            membership: self.membership.clone(),
            dispatcher: self.dispatcher.clone(),
            registry: self.registry.clone(),
            cancel: Arc::new(TestCancel),
            stats: self.stats.clone(),
        }
    }
}

/// Poll `cond` until it holds or the timeout elapses.
pub async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

// ------------------------------------------------------------------------------------
// a hand-driven raw peer, for tests that need full control over the wire
// ------------------------------------------------------------------------------------

pub async fn read_raw_frame(stream: &mut TcpStream) -> std::io::Result<(MsgHeader, Vec<u8>)> {
    let mut header_bytes = [0u8; MsgHeader::SERIALIZED_LEN];
    stream.read_exact(&mut header_bytes).await?;
    let header = MsgHeader::deser(&mut &header_bytes[..]).expect("test peer received an unparsable header");

    let mut payload = vec![0u8; header.payload_len as usize];
    stream.read_exact(&mut payload).await?;
    Ok((header, payload))
}

pub async fn write_raw_frame(
    stream: &mut TcpStream,
    msg_type: MsgType,
    direct_ack: bool,
    msg_id: u16,
    payload: &[u8],
) {
    let mut buf = BytesMut::new();
    MsgHeader::for_payload(payload.len(), msg_type, direct_ack, msg_id)
        .unwrap()
        .ser(&mut buf);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await.unwrap();
}

/// Accept one connection, consume the sender's preamble and answer with `reply`.
pub async fn accept_with_reply(listener: &TcpListener, reply: HandshakeReply) -> (TcpStream, Preamble) {
    let (mut stream, _) = listener.accept().await.unwrap();
    stream.set_nodelay(true).unwrap();

    let (header, payload) = read_raw_frame(&mut stream).await.unwrap();
    assert_eq!(header.msg_type, MsgType::Normal);
    let preamble = Preamble::deser(&mut payload.as_slice()).unwrap();

    let mut reply_payload = BytesMut::new();
    reply.ser(&mut reply_payload);
    write_raw_frame(&mut stream, MsgType::Normal, false, 0, &reply_payload).await;

    (stream, preamble)
}
