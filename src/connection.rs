use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::buffers::BufferVendor;
use crate::chunk_assembler::ChunkAssemblers;
use crate::config::{TransportConfig, MAX_WAIT_TIME};
use crate::dispatcher::MessageDispatcher;
use crate::error::ConnectionError;
use crate::handshake::{HandshakeReply, Preamble, VERSION_ORDINAL};
use crate::io_filter::{is_ignorable_io_error, FilteredStream, SocketFilterFactory};
use crate::member::MemberId;
use crate::membership::{CancelCriterion, MembershipService};
use crate::msg_header::{MsgHeader, MsgType, NO_MSG_ID};
use crate::outgoing_queue::{AddOutcome, ConflationKey, OutgoingQueue, TakeOutcome};
use crate::reader;
use crate::registry::{ConnectionKey, ConnectionRegistry};
use crate::stats::ConnectionStats;
use crate::timers::{AckConnectionGroup, AckParticipant, TimeoutTarget, TransportScheduler};

/// the unique-id a sender assigns to each connection it initiates, echoed in its handshake
static ID_COUNTER: AtomicI64 = AtomicI64::new(1);

/// What a connection is currently doing, as far as the timeout scheduler cares: `Sending`
///  and `ReadingAck` arm the ack-wait timers, `Reading` means the reader is parked on the
///  socket waiting for regular traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Sending,
    PostSending,
    ReadingAck,
    ReceivedAck,
    Reading,
}

/// The external collaborators a connection talks to. All handles are non-owning as far as
///  the object graph goes: the connection table owns connections, nothing here owns the
///  connection back.
#[derive(Clone)]
pub struct Collaborators {
    pub membership: Arc<dyn MembershipService>,
    pub dispatcher: Arc<dyn MessageDispatcher>,
    pub registry: Arc<dyn ConnectionRegistry>,
    pub cancel: Arc<dyn CancelCriterion>,
    pub stats: Arc<ConnectionStats>,
}

/// Per-send options. The message id is only meaningful for chunked transmission and
///  request/reply correlation; leaving it at the sentinel lets the connection assign one
///  when chunking requires it.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub msg_id: u16,
    pub direct_ack: bool,
    pub conflation_key: Option<ConflationKey>,
}

/// Carried explicitly along the send path instead of a thread-local: how many hops of
///  thread-owned receivers led to this send. Caps the creation of new thread-owned
///  outbound connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct SenderContext {
    pub owned_chain_depth: i32,
}

struct HandshakeProgress {
    read: bool,
    cancelled: bool,
}

enum ReplyRouting {
    ResidualReader(oneshot::Receiver<Bytes>),
    OwnRead(ReadHalf<FilteredStream>),
}

/// One logical link to a remote member over one TCP socket: framed messages with a
///  handshake, per-connection ordering semantics, a blocking fast path that trips over
///  into an async queue under backpressure, chunked reassembly, direct-ack replies, and
///  timeout/suspicion signalling.
pub struct Connection {
    config: Arc<TransportConfig>,
    deps: Collaborators,

    is_receiver: bool,
    shared_resource: AtomicBool,
    preserve_order: AtomicBool,
    unique_id: AtomicI64,
    remote_addr: SocketAddr,
    local: MemberId,
    remote: OnceLock<MemberId>,
    remote_version: AtomicU16,
    remote_owned_chain_depth: AtomicI32,
    remote_is_thread_owned: AtomicBool,

    write_half: tokio::sync::Mutex<Option<WriteHalf<FilteredStream>>>,
    read_half: Mutex<Option<ReadHalf<FilteredStream>>>,
    buffer_vendor: Arc<BufferVendor>,

    state: Mutex<ConnectionState>,
    transmission_start: Mutex<Option<Instant>>,
    last_idle_check: Mutex<Instant>,
    ack_timed_out: AtomicBool,
    severe_alerted: AtomicBool,

    connected: AtomicBool,
    closing: AtomicBool,
    stopped: AtomicBool,
    finished_connecting: AtomicBool,
    accessed: AtomicBool,
    socket_in_use: AtomicBool,
    timed_out: AtomicBool,
    async_mode: AtomicBool,

    /// adopted from the receiver's handshake reply when async mode is negotiated
    async_distribution_timeout_ms: AtomicU64,
    async_queue_timeout_ms: AtomicU64,
    async_max_queue_size: AtomicU64,

    handshake: Mutex<HandshakeProgress>,
    handshake_changed: tokio::sync::Notify,

    /// lowered exactly once, at close; long socket operations select against it
    closed: watch::Sender<bool>,

    queue: OutgoingQueue,
    pusher_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    pusher_task_id: Mutex<Option<tokio::task::Id>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    reader_task_id: Mutex<Option<tokio::task::Id>>,

    ack_reply_slot: Mutex<Option<oneshot::Sender<Bytes>>>,
    /// a direct reply that arrived before `read_ack` registered its waiter
    early_reply: Mutex<Option<Bytes>>,

    ack_group: Mutex<Option<Arc<AckConnectionGroup>>>,
    weak_self: OnceLock<Weak<Connection>>,
    participant_identity: OnceLock<Weak<dyn AckParticipant>>,

    msg_id_counter: AtomicU16,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl Connection {
    /// Initiate a connection to `remote` and run the handshake once. Most callers want
    ///  [`Connection::connect_with_retries`] instead.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        config: Arc<TransportConfig>,
        deps: Collaborators,
        scheduler: &Arc<TransportScheduler>,
        local: MemberId,
        remote: MemberId,
        shared_resource: bool,
        preserve_order: bool,
        ctx: &SenderContext,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let filter = SocketFilterFactory::new(config.tls.clone());
        let stream = filter.connect(remote.socket_addr, config.connect_timeout()).await?;

        let conn = Self::build(
            config,
            deps,
            false,
            remote.socket_addr,
            stream,
            local,
            Some(remote),
            shared_resource,
            preserve_order,
            ID_COUNTER.fetch_add(1, Ordering::Relaxed),
        );
        let target: Weak<dyn TimeoutTarget> = Arc::downgrade(&(conn.clone() as Arc<dyn TimeoutTarget>));
        scheduler.register(target);

        let preamble = Preamble {
            member: local,
            shared_resource,
            preserve_order,
            unique_id: conn.unique_id.load(Ordering::Relaxed),
            version_ordinal: VERSION_ORDINAL,
            owned_chain_depth: ctx.owned_chain_depth,
        };
        let mut payload = BytesMut::new();
        preamble.ser(&mut payload);
        let frame = frame_for(&payload, MsgType::Normal, false, NO_MSG_ID)?;

        conn.spawn_reader();

        if let Err(e) = conn.send_blocking(&frame).await {
            conn.request_close("could not send the handshake").await;
            return Err(e);
        }

        conn.await_handshake().await?;
        conn.finished_connecting.store(true, Ordering::SeqCst);
        debug!("connection to {:?} established (unique id {})", remote, conn.unique_id());
        Ok(conn)
    }

    /// The sender-side retry loop for new connections: retries transient failures every
    ///  reconnect interval while the remote is still in the membership view, escalating
    ///  to suspicion after the ack-wait threshold and to a severe alert after the
    ///  severe-alert threshold on top of that.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect_with_retries(
        config: Arc<TransportConfig>,
        deps: Collaborators,
        scheduler: &Arc<TransportScheduler>,
        local: MemberId,
        remote: MemberId,
        shared_resource: bool,
        preserve_order: bool,
        ctx: &SenderContext,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let start = Instant::now();
        let mut suspect_initiated = false;
        let mut severe_logged = false;
        let mut next_warning = start + config.ack_wait_threshold;

        loop {
            if let Some(reason) = deps.cancel.cancel_in_progress() {
                return Err(ConnectionError::Cancelled(reason));
            }
            if !deps.membership.is_member(remote)
                || deps.membership.is_shunned(remote)
                || deps.membership.shutdown_in_progress()
            {
                return Err(ConnectionError::MemberLeft(remote));
            }

            match Connection::connect(
                config.clone(),
                deps.clone(),
                scheduler,
                local,
                remote,
                shared_resource,
                preserve_order,
                ctx,
            )
            .await
            {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_fatal_for_connect() => return Err(e),
                Err(e) => {
                    let now = Instant::now();
                    let elapsed = now - start;

                    if elapsed >= config.ack_wait_threshold {
                        if !suspect_initiated {
                            suspect_initiated = true;
                            warn!("unable to form a TCP connection to {:?} within the ack-wait threshold - initiating suspect processing", remote);
                            deps.membership
                                .suspect_member(remote, format!("Unable to form a TCP connection in {:?}", elapsed))
                                .await;
                        } else if now >= next_warning {
                            warn!("still attempting to form a TCP connection to {:?} after {:?}", remote, elapsed);
                            next_warning = now + config.ack_wait_threshold;
                        }
                    }
                    if !config.ack_severe_alert_threshold.is_zero()
                        && !severe_logged
                        && elapsed >= config.ack_wait_threshold + config.ack_severe_alert_threshold
                    {
                        severe_logged = true;
                        error!("unable to form a TCP connection to {:?} for {:?} - severe alert", remote, elapsed);
                    }

                    debug!("connect attempt to {:?} failed: {}", remote, e);
                    tokio::time::sleep(config.reconnect_wait).await;
                }
            }
        }
    }

    /// Construct the receiver end for an already-accepted socket. The reader task starts
    ///  immediately and performs the handshake; until it has, the remote identity is
    ///  unknown.
    pub async fn accept(
        config: Arc<TransportConfig>,
        deps: Collaborators,
        scheduler: &Arc<TransportScheduler>,
        local: MemberId,
        stream: TcpStream,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let remote_addr = stream.peer_addr()?;
        let filter = SocketFilterFactory::new(config.tls.clone());
        let stream = filter.accept(stream).await?;

        let conn = Self::build(config, deps, true, remote_addr, stream, local, None, true, true, 0);
        let target: Weak<dyn TimeoutTarget> = Arc::downgrade(&(conn.clone() as Arc<dyn TimeoutTarget>));
        scheduler.register(target);
        conn.spawn_reader();
        Ok(conn)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        config: Arc<TransportConfig>,
        deps: Collaborators,
        is_receiver: bool,
        remote_addr: SocketAddr,
        stream: FilteredStream,
        local: MemberId,
        remote: Option<MemberId>,
        shared_resource: bool,
        preserve_order: bool,
        unique_id: i64,
    ) -> Arc<Connection> {
        let (read_half, write_half) = tokio::io::split(stream);
        let stats = deps.stats.clone();
        let buffer_vendor = BufferVendor::new(config.socket_buffer_size);

        let conn = Arc::new(Connection {
            async_distribution_timeout_ms: AtomicU64::new(config.async_distribution_timeout.as_millis() as u64),
            async_queue_timeout_ms: AtomicU64::new(config.async_queue_timeout.as_millis() as u64),
            async_max_queue_size: AtomicU64::new(config.async_max_queue_size),
            config,
            deps,
            is_receiver,
            shared_resource: AtomicBool::new(shared_resource),
            preserve_order: AtomicBool::new(preserve_order),
            unique_id: AtomicI64::new(unique_id),
            remote_addr,
            local,
            remote: OnceLock::new(),
            remote_version: AtomicU16::new(0),
            remote_owned_chain_depth: AtomicI32::new(0),
            remote_is_thread_owned: AtomicBool::new(false),
            write_half: tokio::sync::Mutex::new(Some(write_half)),
            read_half: Mutex::new(Some(read_half)),
            buffer_vendor,
            state: Mutex::new(ConnectionState::Idle),
            transmission_start: Mutex::new(None),
            last_idle_check: Mutex::new(Instant::now()),
            ack_timed_out: AtomicBool::new(false),
            severe_alerted: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            finished_connecting: AtomicBool::new(false),
            accessed: AtomicBool::new(true),
            socket_in_use: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            async_mode: AtomicBool::new(false),
            handshake: Mutex::new(HandshakeProgress { read: false, cancelled: false }),
            handshake_changed: tokio::sync::Notify::new(),
            closed: watch::Sender::new(false),
            queue: OutgoingQueue::new(stats),
            pusher_task: tokio::sync::Mutex::new(None),
            pusher_task_id: Mutex::new(None),
            reader_task: Mutex::new(None),
            reader_task_id: Mutex::new(None),
            ack_reply_slot: Mutex::new(None),
            early_reply: Mutex::new(None),
            ack_group: Mutex::new(None),
            weak_self: OnceLock::new(),
            participant_identity: OnceLock::new(),
            msg_id_counter: AtomicU16::new(NO_MSG_ID.wrapping_add(1)),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        });

        if let Some(remote) = remote {
            let _ = conn.remote.set(remote);
        }
        let _ = conn.weak_self.set(Arc::downgrade(&conn));
        let participant: Weak<dyn AckParticipant> = Arc::downgrade(&(conn.clone() as Arc<dyn AckParticipant>));
        let _ = conn.participant_identity.set(participant);

        conn
    }

    fn spawn_reader(self: &Arc<Self>) {
        let task = tokio::spawn(reader::run_reader(self.clone()));
        *self.reader_task_id.lock().unwrap() = Some(task.id());
        *self.reader_task.lock().unwrap() = Some(task);
    }

    // --------------------------------------------------------------------------------
    // send paths
    // --------------------------------------------------------------------------------

    /// Send one serialized message. Payloads above the frame limit go out as a chunk
    ///  series under one message id; everything else is a single NORMAL frame.
    ///
    /// On a shared ordered connection in async mode this may queue instead of blocking;
    ///  either way, wire order equals the order in which producers committed their sends.
    pub async fn send_message(&self, payload: &[u8], opts: &SendOptions) -> Result<(), ConnectionError> {
        if let Some(reason) = self.deps.cancel.cancel_in_progress() {
            return Err(ConnectionError::Cancelled(reason));
        }
        if self.queue.disconnect_requested() {
            return Err(ConnectionError::ForcedDisconnect(self.remote_or_placeholder()));
        }
        if !self.connected.load(Ordering::SeqCst) || self.closing.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected(self.remote_or_placeholder()));
        }

        let frames = self.build_frames(payload, opts)?;
        self.write_frames(frames, opts).await?;

        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.deps.stats.inc_messages_sent();
        Ok(())
    }

    fn build_frames(&self, payload: &[u8], opts: &SendOptions) -> Result<BytesMut, ConnectionError> {
        let max = self.config.max_frame_payload;
        if payload.len() <= max {
            return frame_for(payload, MsgType::Normal, opts.direct_ack, opts.msg_id);
        }

        // a chunk series: every frame carries the same id so the receiver can reassemble
        let msg_id = if opts.msg_id == NO_MSG_ID { self.next_msg_id() } else { opts.msg_id };
        let num_frames = payload.len().div_ceil(max);
        let mut buf = BytesMut::with_capacity(payload.len() + num_frames * MsgHeader::SERIALIZED_LEN);

        let mut rest = payload;
        while rest.len() > max {
            let (chunk, tail) = rest.split_at(max);
            MsgHeader::for_payload(chunk.len(), MsgType::Chunk, opts.direct_ack, msg_id)?.ser(&mut buf);
            buf.extend_from_slice(chunk);
            rest = tail;
        }
        MsgHeader::for_payload(rest.len(), MsgType::EndChunk, opts.direct_ack, msg_id)?.ser(&mut buf);
        buf.extend_from_slice(rest);
        Ok(buf)
    }

    async fn write_frames(&self, frames: BytesMut, opts: &SendOptions) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Sending);
        self.arm_ack_timers();
        self.socket_in_use.store(true, Ordering::SeqCst);

        let use_async = self.async_mode.load(Ordering::SeqCst)
            && self.preserve_order.load(Ordering::SeqCst)
            && self.shared_resource.load(Ordering::SeqCst);

        let result = if use_async {
            self.send_async(frames, opts.conflation_key.clone()).await
        } else {
            self.send_blocking(&frames).await
        };

        self.socket_in_use.store(false, Ordering::SeqCst);
        match (&result, opts.direct_ack) {
            (Ok(()), true) => self.set_state(ConnectionState::PostSending),
            _ => {
                self.set_state(ConnectionState::Idle);
                self.disarm_ack_timers();
            }
        }
        self.mark_accessed();
        result
    }

    /// The sync writer: serialized by the output lock, blocking on nothing but TCP.
    async fn send_blocking(&self, frames: &[u8]) -> Result<(), ConnectionError> {
        let mut closed = self.closed.subscribe();
        let mut guard = self.write_half.lock().await;
        let Some(out) = guard.as_mut() else {
            return Err(ConnectionError::NotConnected(self.remote_or_placeholder()));
        };

        let result = tokio::select! {
            res = out.write_all(frames) => res,
            _ = closed.changed() => {
                return Err(ConnectionError::NotConnected(self.remote_or_placeholder()));
            }
        };
        drop(guard);

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if is_ignorable_io_error(&e) {
                    debug!("write to {:?} failed: {}", self.remote_addr, e);
                } else {
                    warn!("write to {:?} failed: {}", self.remote_addr, e);
                }
                self.request_close("write failure").await;
                Err(ConnectionError::NotConnected(self.remote_or_placeholder()))
            }
        }
    }

    /// The queue-feeding path: give the socket one distribution timeout's worth of grace,
    ///  then trip over into the outgoing queue and let the pusher flush. A partially
    ///  written message is queued non-conflatable - its prefix is already on the wire.
    ///
    /// Ordering invariant: a producer only writes directly while no queue flush is in
    ///  progress, and it re-checks that under the output lock. The trip-over enqueues and
    ///  raises `queuing_in_progress` while still holding the output lock, so no later
    ///  producer can slip its bytes ahead of queued ones.
    async fn send_async(&self, mut frames: BytesMut, key: Option<ConflationKey>) -> Result<(), ConnectionError> {
        let max_queue = self.async_max_queue_size.load(Ordering::SeqCst);

        loop {
            if self.queue.queuing_in_progress() {
                match self.queue.add(frames, key.clone(), true, false, max_queue) {
                    AddOutcome::Queued => return Ok(()),
                    AddOutcome::NotQueued(returned) => frames = returned,
                    AddOutcome::Overflow { would_be_bytes } => {
                        return self.on_queue_overflow(would_be_bytes).await;
                    }
                    AddOutcome::DisconnectRequested => {
                        return Err(ConnectionError::ForcedDisconnect(self.remote_or_placeholder()));
                    }
                }
            }

            let mut closed = self.closed.subscribe();
            let mut guard = self.write_half.lock().await;
            if self.queue.queuing_in_progress() {
                // a flush started while we waited for the lock; queue behind it
                drop(guard);
                continue;
            }
            let Some(out) = guard.as_mut() else {
                return Err(ConnectionError::NotConnected(self.remote_or_placeholder()));
            };

            let grace = Duration::from_millis(self.async_distribution_timeout_ms.load(Ordering::SeqCst));
            let total = frames.len();
            let mut deadline = Instant::now() + grace;
            loop {
                tokio::select! {
                    res = out.write_buf(&mut frames) => {
                        match res {
                            Ok(0) => {}
                            Ok(_) => {
                                if frames.is_empty() {
                                    return Ok(());
                                }
                                // progress resets the grace period; only a stalled socket queues
                                deadline = Instant::now() + grace;
                            }
                            Err(e) => {
                                drop(guard);
                                debug!("async write to {:?} failed: {}", self.remote_addr, e);
                                self.request_close("write failure").await;
                                return Err(ConnectionError::NotConnected(self.remote_or_placeholder()));
                            }
                        }
                    }
                    _ = closed.changed() => {
                        return Err(ConnectionError::NotConnected(self.remote_or_placeholder()));
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        let partially_written = frames.len() < total;
                        let conflatable = !partially_written;

                        trace!("socket to {:?} stalled - queuing {} bytes", self.remote_addr, frames.len());
                        match self.queue.add(frames, key, conflatable, true, max_queue) {
                            AddOutcome::Queued => {}
                            AddOutcome::Overflow { would_be_bytes } => {
                                drop(guard);
                                return self.on_queue_overflow(would_be_bytes).await;
                            }
                            AddOutcome::DisconnectRequested => {
                                drop(guard);
                                return Err(ConnectionError::ForcedDisconnect(self.remote_or_placeholder()));
                            }
                            AddOutcome::NotQueued(_) => unreachable!("forced enqueue never reports NotQueued"),
                        }
                        self.queue.begin_queuing();
                        drop(guard);
                        self.start_pusher().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn on_queue_overflow(&self, would_be_bytes: u64) -> Result<(), ConnectionError> {
        warn!(
            "queued bytes {} exceed the ceiling of {} - asking the slow receiver {:?} to disconnect",
            would_be_bytes,
            self.async_max_queue_size.load(Ordering::SeqCst),
            self.remote_addr
        );
        self.deps.stats.inc_async_queue_size_exceeded();
        self.disconnect_slow_receiver().await;
        Err(ConnectionError::ForcedDisconnect(self.remote_or_placeholder()))
    }

    async fn start_pusher(&self) {
        let mut guard = self.pusher_task.lock().await;
        if let Some(previous) = guard.take() {
            // the previous pusher has drained and is on its way out; serialize the handover
            let _ = previous.await;
        }
        self.queue.begin_queuing();

        let conn = self
            .weak_self
            .get()
            .and_then(Weak::upgrade)
            .expect("a live connection always upgrades its own weak handle");
        let task = tokio::spawn(run_pusher(conn));
        *self.pusher_task_id.lock().unwrap() = Some(task.id());
        *guard = Some(task);
    }

    /// Ask membership to force-remove the slow receiver, then wait until the view change
    ///  has propagated or a grace period elapses. Only the first caller does anything.
    pub(crate) async fn disconnect_slow_receiver(&self) {
        if !self.queue.request_disconnect() {
            return;
        }
        let Some(remote) = self.remote() else {
            return;
        };

        self.deps
            .membership
            .request_member_removal(remote, "Disconnected as a slow-receiver".to_string())
            .await;

        let deadline = Instant::now() + Duration::from_millis(3000);
        let mut wait = Duration::from_millis(1);
        while self.deps.membership.is_member(remote) && Instant::now() < deadline {
            tokio::time::sleep(wait).await;
            wait = (wait * 2).min(MAX_WAIT_TIME);
        }
        if self.deps.membership.is_member(remote) {
            debug!("force disconnect of {:?} timed out waiting for the view change", remote);
        }
    }

    // --------------------------------------------------------------------------------
    // direct-ack path
    // --------------------------------------------------------------------------------

    /// Read the one reply the peer sends directly on this socket. Never goes through the
    ///  async queue or the dispatcher. A timeout is reported as [`ConnectionError::ReplyTimeout`]
    ///  so callers can tell a blocked reply from a dead socket.
    pub async fn read_ack(&self, reply_timeout: Duration) -> Result<Bytes, ConnectionError> {
        self.set_state(ConnectionState::ReadingAck);
        self.arm_ack_timers_if_unarmed();

        // only shared ordered senders run a residual reader that owns the socket
        let residual = self.shared_resource() && self.preserve_order() && self.reader_running();
        let routing = if residual {
            let early_or_rx = {
                let mut slot = self.ack_reply_slot.lock().unwrap();
                match self.early_reply.lock().unwrap().take() {
                    Some(early) => Ok(early),
                    None => {
                        let (tx, rx) = oneshot::channel();
                        *slot = Some(tx);
                        Err(rx)
                    }
                }
            };
            match early_or_rx {
                Ok(early) => {
                    self.set_state(ConnectionState::ReceivedAck);
                    self.clear_ack_state();
                    self.mark_accessed();
                    return Ok(early);
                }
                Err(rx) => ReplyRouting::ResidualReader(rx),
            }
        } else {
            match self.take_read_half() {
                Some(half) => ReplyRouting::OwnRead(half),
                None => {
                    self.clear_ack_state();
                    return Err(ConnectionError::NotConnected(self.remote_or_placeholder()));
                }
            }
        };

        let result = match routing {
            ReplyRouting::ResidualReader(rx) => {
                let mut closed = self.closed.subscribe();
                tokio::select! {
                    received = tokio::time::timeout(reply_timeout, rx) => match received {
                        Err(_) => {
                            self.ack_reply_slot.lock().unwrap().take();
                            Err(ConnectionError::ReplyTimeout)
                        }
                        Ok(Err(_)) => Err(ConnectionError::NotConnected(self.remote_or_placeholder())),
                        Ok(Ok(payload)) => Ok(payload),
                    },
                    _ = closed.changed() => Err(ConnectionError::NotConnected(self.remote_or_placeholder())),
                }
            }
            ReplyRouting::OwnRead(mut half) => {
                let result = tokio::time::timeout(reply_timeout, self.read_one_frame(&mut half)).await;
                self.put_back_read_half(half);
                match result {
                    Err(_) => Err(ConnectionError::ReplyTimeout),
                    Ok(r) => r,
                }
            }
        };

        if result.is_ok() {
            self.set_state(ConnectionState::ReceivedAck);
        }
        self.clear_ack_state();
        self.mark_accessed();
        result
    }

    /// The small single-use reader behind `read_ack` on thread-owned connections.
    async fn read_one_frame(&self, half: &mut ReadHalf<FilteredStream>) -> Result<Bytes, ConnectionError> {
        use tokio::io::AsyncReadExt;

        let mut lease = self
            .buffer_vendor
            .lease("direct-ack reader")
            .map_err(|_| ConnectionError::NotConnected(self.remote_or_placeholder()))?;

        loop {
            if lease.len() >= MsgHeader::SERIALIZED_LEN {
                let mut header_bytes = &(*lease)[..MsgHeader::SERIALIZED_LEN];
                let header = MsgHeader::deser(&mut header_bytes)?;
                let frame_len = header.frame_len();
                if lease.len() >= frame_len {
                    use bytes::Buf;
                    lease.advance(MsgHeader::SERIALIZED_LEN);
                    return Ok(lease.split_to(frame_len - MsgHeader::SERIALIZED_LEN).freeze());
                }
                lease.ensure_room(frame_len - lease.len());
            } else {
                lease.ensure_room(MsgHeader::SERIALIZED_LEN);
            }

            let n = half.read_buf(&mut *lease).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)));
            }
        }
    }

    // --------------------------------------------------------------------------------
    // handshake processing (called from the reader task)
    // --------------------------------------------------------------------------------

    pub(crate) async fn on_handshake_preamble(&self, payload: Bytes) -> Result<(), String> {
        let preamble = match Preamble::deser(&mut payload.as_ref()) {
            Ok(p) => p,
            Err(e) => {
                warn!("rejecting connection from {:?}: {}", self.remote_addr, e);
                return Err(format!("bad handshake: {}", e));
            }
        };
        trace!("handshake preamble from {:?}: {:?}", self.remote_addr, preamble);

        let _ = self.remote.set(preamble.member);
        self.shared_resource.store(preamble.shared_resource, Ordering::SeqCst);
        self.preserve_order.store(preamble.preserve_order, Ordering::SeqCst);
        self.unique_id.store(preamble.unique_id, Ordering::SeqCst);
        self.remote_version.store(preamble.version_ordinal, Ordering::SeqCst);
        self.remote_owned_chain_depth.store(preamble.owned_chain_depth, Ordering::SeqCst);
        self.remote_is_thread_owned.store(!preamble.shared_resource, Ordering::SeqCst);

        // the membership check and the reply happen back to back, before any dispatch
        if !self.deps.membership.register_surprise_member(preamble.member).await {
            return Err("this member is shunned".to_string());
        }

        let reply = if self.config.async_mode_configured() {
            HandshakeReply::OkWithAsyncInfo {
                async_distribution_timeout_millis: self.config.async_distribution_timeout.as_millis() as i32,
                async_queue_timeout_millis: self.config.async_queue_timeout.as_millis() as i32,
                async_max_queue_size: self.config.async_max_queue_size as i32,
                version_ordinal: VERSION_ORDINAL,
            }
        } else {
            HandshakeReply::Ok
        };
        let mut reply_payload = BytesMut::new();
        reply.ser(&mut reply_payload);
        let frame = frame_for(&reply_payload, MsgType::Normal, false, NO_MSG_ID)
            .expect("a handshake reply is always far below the frame limit");
        if let Err(e) = self.send_blocking(&frame).await {
            return Err(format!("could not send the handshake reply: {}", e));
        }

        self.mark_handshake_read();

        if self.config.require_peer_authentication
            && !self.deps.membership.await_membership_check(preamble.member).await
        {
            return Err(format!("member {:?} was not cleared by the membership check", preamble.member));
        }

        Ok(())
    }

    /// Returns true if the reader task is done after the handshake (thread-owned sender
    ///  connections); shared ordered senders keep a residual reader.
    ///
    /// Does NOT mark the handshake as read: the reader does that once the socket handoff
    ///  is complete, so a caller woken from [`Connection::connect`] finds the read half in
    ///  place.
    pub(crate) fn on_handshake_reply(&self, payload: Bytes) -> Result<bool, String> {
        let reply = match HandshakeReply::deser(&mut payload.as_ref()) {
            Ok(r) => r,
            Err(e) => return Err(format!("bad handshake reply: {}", e)),
        };

        if let HandshakeReply::OkWithAsyncInfo {
            async_distribution_timeout_millis,
            async_queue_timeout_millis,
            async_max_queue_size,
            version_ordinal,
        } = reply
        {
            self.remote_version.store(version_ordinal, Ordering::SeqCst);
            self.async_distribution_timeout_ms
                .store(async_distribution_timeout_millis.max(0) as u64, Ordering::SeqCst);
            self.async_queue_timeout_ms
                .store(async_queue_timeout_millis.max(0) as u64, Ordering::SeqCst);
            self.async_max_queue_size
                .store(async_max_queue_size.max(0) as u64, Ordering::SeqCst);

            if self.preserve_order.load(Ordering::SeqCst) && async_distribution_timeout_millis != 0 {
                debug!("using async mode towards {:?}", self.remote_addr);
                self.async_mode.store(true, Ordering::SeqCst);
            }
        }

        let residual_reader =
            self.shared_resource.load(Ordering::SeqCst) && self.preserve_order.load(Ordering::SeqCst);
        Ok(!residual_reader)
    }

    pub(crate) fn mark_handshake_read(&self) {
        self.handshake.lock().unwrap().read = true;
        self.handshake_changed.notify_waiters();
    }

    async fn await_handshake(&self) -> Result<(), ConnectionError> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            let notified = self.handshake_changed.notified();
            {
                let hs = self.handshake.lock().unwrap();
                if hs.read {
                    return Ok(());
                }
                if hs.cancelled {
                    return Err(ConnectionError::Cancelled("handshake cancelled".to_string()));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.request_close("no handshake reply").await;
                return Err(ConnectionError::HandshakeTimeout(self.remote_addr));
            }
        }
    }

    // --------------------------------------------------------------------------------
    // frame intake (called from the reader task)
    // --------------------------------------------------------------------------------

    pub(crate) async fn on_message_frame(
        &self,
        header: MsgHeader,
        payload: Bytes,
        assemblers: &mut ChunkAssemblers,
    ) -> Result<(), ConnectionError> {
        match header.msg_type {
            MsgType::Normal => {
                if !self.is_receiver {
                    // the only regular traffic towards a sender socket is a direct reply
                    let mut slot = self.ack_reply_slot.lock().unwrap();
                    match slot.take() {
                        Some(tx) => {
                            let _ = tx.send(payload);
                        }
                        None => {
                            // the reply won the race against read_ack registering itself;
                            //  park it until the waiter shows up (slot lock held throughout)
                            *self.early_reply.lock().unwrap() = Some(payload);
                        }
                    }
                    return Ok(());
                }
                self.deliver(header.msg_id, header.direct_ack, payload).await;
                Ok(())
            }
            MsgType::Chunk => assemblers.on_chunk(header.msg_id, &payload),
            MsgType::EndChunk => {
                let complete = assemblers.on_end_chunk(header.msg_id, &payload)?;
                self.deliver(header.msg_id, header.direct_ack, complete).await;
                Ok(())
            }
        }
    }

    async fn deliver(&self, msg_id: u16, direct_ack: bool, payload: Bytes) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.deps.stats.inc_messages_received();
        self.mark_accessed();
        self.deps
            .dispatcher
            .on_message(self.remote_or_placeholder(), msg_id, direct_ack, payload)
            .await;
    }

    // --------------------------------------------------------------------------------
    // lifecycle
    // --------------------------------------------------------------------------------

    /// Close this connection. Idempotent; every path through here runs the cleanup once.
    pub async fn request_close(&self, reason: &str) {
        self.close(reason, true, false).await;
    }

    /// Graceful replace: forces removal from the connection table even if another close
    ///  is already in flight.
    pub async fn close_old_connection(&self, reason: &str) {
        self.close(reason, true, true).await;
    }

    async fn close(&self, reason: &str, remove_endpoint: bool, force_remove: bool) {
        let first = self
            .closing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();

        if first {
            debug!("closing connection to {:?}: {}", self.remote_addr, reason);
            self.connected.store(false, Ordering::SeqCst);

            // wake a sender still waiting for its handshake reply
            {
                let mut hs = self.handshake.lock().unwrap();
                if !hs.read {
                    hs.cancelled = true;
                }
            }
            self.handshake_changed.notify_waiters();

            // unblock every socket operation in flight
            let _ = self.closed.send(true);

            // abandon whatever is still queued; producers waiting on the pusher wake up
            self.queue.shutdown();

            let current_task = tokio::task::try_id();

            // wait for the pusher to observe the close, unless we are the pusher
            let is_pusher = current_task.is_some() && current_task == *self.pusher_task_id.lock().unwrap();
            if !is_pusher {
                let pusher = self.pusher_task.lock().await.take();
                if let Some(handle) = pusher {
                    if tokio::time::timeout(Duration::from_millis(500), handle).await.is_err() {
                        debug!("pusher for {:?} did not exit in time", self.remote_addr);
                    }
                }
            }

            // close the socket through the asynchronous socket closer so a hung TCP stack
            //  cannot stall the caller
            if let Some(conn) = self.weak_self.get().and_then(Weak::upgrade) {
                tokio::spawn(async move {
                    let write = conn.write_half.lock().await.take();
                    if let Some(mut write) = write {
                        let _ = write.shutdown().await;
                    }
                    let read = conn.read_half.lock().unwrap().take();
                    drop(read);
                });
            }

            // join the reader, bounded, unless we are the reader
            let is_reader = current_task.is_some() && current_task == *self.reader_task_id.lock().unwrap();
            if !is_reader {
                let reader = self.reader_task.lock().unwrap().take();
                if let Some(handle) = reader {
                    let mut join_wait = Duration::from_millis(500);
                    if self.config.enable_network_partition_detection {
                        join_wait += Duration::from_millis(1500);
                    }
                    let abort = handle.abort_handle();
                    if tokio::time::timeout(join_wait, handle).await.is_err() {
                        abort.abort();
                    }
                }
            }

            self.buffer_vendor.destruct();
            self.stopped.store(true, Ordering::SeqCst);
        }

        if remove_endpoint && (first || force_remove) {
            self.deps.registry.remove_connection(self.connection_key());
        }
    }

    // --------------------------------------------------------------------------------
    // timeout checks (driven by the shared scheduler)
    // --------------------------------------------------------------------------------

    async fn check_ack_timeouts(&self, now: Instant) {
        let state = self.state();
        if !matches!(state, ConnectionState::Sending | ConnectionState::ReadingAck) {
            return;
        }
        let Some(start) = *self.transmission_start.lock().unwrap() else {
            return;
        };

        let ack_wait = self.config.ack_wait_threshold;
        if ack_wait.is_zero() {
            return;
        }
        let severe = self.config.ack_severe_alert_threshold;

        if !severe.is_zero() && now >= start + ack_wait + severe {
            if !self.severe_alerted.swap(true, Ordering::SeqCst) {
                error!(
                    "member {:?} has not responded for {:?} while in state {:?} - severe alert",
                    self.remote_or_placeholder(),
                    now - start,
                    state
                );
                // one alert per slow transmission: peers in the ack group get their
                //  deadline pushed out instead of alerting as well
                let group = self.ack_group.lock().unwrap().clone();
                if let (Some(group), Some(identity)) = (group, self.participant_identity.get()) {
                    group.postpone_others(identity, severe);
                }
                *self.transmission_start.lock().unwrap() = None;
            }
            return;
        }

        if now >= start + ack_wait && !self.ack_timed_out.swap(true, Ordering::SeqCst) {
            let activity = if state == ConnectionState::Sending {
                "unable to transmit a message"
            } else {
                "unable to receive a response to a message"
            };
            warn!(
                "{:?} elapsed waiting for a response from {:?}: sender has been {}",
                now - start,
                self.remote_or_placeholder(),
                activity
            );
            if !severe.is_zero() {
                self.deps
                    .membership
                    .suspect_member(self.remote_or_placeholder(), activity.to_string())
                    .await;
            }
        }
    }

    async fn check_idle_timeout(&self, now: Instant) {
        // relaxed shared channels carry failure-detection traffic and are never idle-closed
        if self.shared_resource.load(Ordering::SeqCst) && !self.preserve_order.load(Ordering::SeqCst) {
            return;
        }
        if self.socket_in_use.load(Ordering::SeqCst) {
            return;
        }

        {
            let mut last = self.last_idle_check.lock().unwrap();
            if now.saturating_duration_since(*last) < self.config.idle_connection_timeout {
                return;
            }
            *last = now;
        }

        if !self.accessed.swap(false, Ordering::SeqCst) {
            debug!("connection to {:?} was idle for a full period - closing for reconnect", self.remote_addr);
            self.timed_out.store(true, Ordering::SeqCst);
            self.request_close("idle connection").await;
        }
    }

    fn arm_ack_timers(&self) {
        *self.transmission_start.lock().unwrap() = Some(Instant::now());
        self.ack_timed_out.store(false, Ordering::SeqCst);
        self.severe_alerted.store(false, Ordering::SeqCst);
    }

    fn arm_ack_timers_if_unarmed(&self) {
        let mut start = self.transmission_start.lock().unwrap();
        if start.is_none() {
            *start = Some(Instant::now());
            self.ack_timed_out.store(false, Ordering::SeqCst);
            self.severe_alerted.store(false, Ordering::SeqCst);
        }
    }

    fn disarm_ack_timers(&self) {
        *self.transmission_start.lock().unwrap() = None;
    }

    fn clear_ack_state(&self) {
        self.set_state(ConnectionState::Idle);
        self.disarm_ack_timers();
    }

    /// The set of peers taking part in the current transmission; used to damp the
    ///  severe-alert cascade.
    pub fn set_ack_group(&self, group: Option<Arc<AckConnectionGroup>>) {
        if let (Some(group), Some(identity)) = (&group, self.participant_identity.get()) {
            group.add(identity.clone());
        }
        *self.ack_group.lock().unwrap() = group;
    }

    // --------------------------------------------------------------------------------
    // accessors and small helpers
    // --------------------------------------------------------------------------------

    pub fn remote(&self) -> Option<MemberId> {
        self.remote.get().copied()
    }

    pub(crate) fn remote_or_placeholder(&self) -> MemberId {
        self.remote().unwrap_or(MemberId { unique: 0, socket_addr: self.remote_addr })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local(&self) -> MemberId {
        self.local
    }

    pub fn is_receiver(&self) -> bool {
        self.is_receiver
    }

    pub fn shared_resource(&self) -> bool {
        self.shared_resource.load(Ordering::SeqCst)
    }

    pub fn preserve_order(&self) -> bool {
        self.preserve_order.load(Ordering::SeqCst)
    }

    pub fn unique_id(&self) -> i64 {
        self.unique_id.load(Ordering::SeqCst)
    }

    pub fn remote_version(&self) -> u16 {
        self.remote_version.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn finished_connecting(&self) -> bool {
        self.finished_connecting.load(Ordering::SeqCst)
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn async_mode(&self) -> bool {
        self.async_mode.load(Ordering::SeqCst)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn queued_bytes(&self) -> u64 {
        self.queue.queued_bytes()
    }

    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey {
            remote: self.remote_or_placeholder(),
            shared: self.shared_resource(),
            preserve_order: self.preserve_order(),
            is_receiver: self.is_receiver,
        }
    }

    /// The context outbound sends triggered by this peer's messages should carry: peers
    ///  with thread-owned sockets make our own sends thread-owned as well, one hop deeper
    ///  in the chain, when dominance is configured.
    pub fn sender_context_for_replies(&self) -> SenderContext {
        if self.config.thread_owned_sockets_dominate && self.remote_is_thread_owned.load(Ordering::SeqCst) {
            SenderContext {
                owned_chain_depth: self.remote_owned_chain_depth.load(Ordering::SeqCst) + 1,
            }
        } else {
            SenderContext::default()
        }
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn deps(&self) -> &Collaborators {
        &self.deps
    }

    pub(crate) fn buffer_vendor(&self) -> &Arc<BufferVendor> {
        &self.buffer_vendor
    }

    pub(crate) fn handshake_read(&self) -> bool {
        self.handshake.lock().unwrap().read
    }

    pub(crate) fn mark_accessed(&self) {
        self.accessed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// The reader flags `Reading` only while actually parked on the socket, and only from
    ///  `Idle`, so the ack-wait scheduler can tell reading-for-ack from reading-for-message.
    pub(crate) fn enter_reading_state(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Idle {
            *state = ConnectionState::Reading;
        }
    }

    pub(crate) fn leave_reading_state(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Reading {
            *state = ConnectionState::Idle;
        }
    }

    pub(crate) fn take_read_half(&self) -> Option<ReadHalf<FilteredStream>> {
        self.read_half.lock().unwrap().take()
    }

    pub(crate) fn put_back_read_half(&self, half: ReadHalf<FilteredStream>) {
        *self.read_half.lock().unwrap() = Some(half);
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn reader_running(&self) -> bool {
        self.reader_task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn next_msg_id(&self) -> u16 {
        loop {
            let id = self.msg_id_counter.fetch_add(1, Ordering::Relaxed);
            if id != NO_MSG_ID {
                return id;
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Connection[{} to {:?}, shared={}, ordered={}]",
            if self.is_receiver { "receiver" } else { "sender" },
            self.remote_addr,
            self.shared_resource(),
            self.preserve_order()
        )
    }
}

#[async_trait]
impl TimeoutTarget for Connection {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn check_timeouts(&self, now: Instant) {
        self.check_ack_timeouts(now).await;
        self.check_idle_timeout(now).await;
    }
}

impl AckParticipant for Connection {
    fn postpone_severe_alert(&self, by: Duration) {
        let mut start = self.transmission_start.lock().unwrap();
        if let Some(start) = start.as_mut() {
            *start += by;
        }
    }
}

pub(crate) fn frame_for(
    payload: &[u8],
    msg_type: MsgType,
    direct_ack: bool,
    msg_id: u16,
) -> Result<BytesMut, ConnectionError> {
    let header = MsgHeader::for_payload(payload.len(), msg_type, direct_ack, msg_id)?;
    let mut buf = BytesMut::with_capacity(MsgHeader::SERIALIZED_LEN + payload.len());
    header.ser(&mut buf);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// The dedicated flusher: drains the outgoing queue in FIFO order with blocking writes,
///  checks the byte ceiling and the per-write time limit, and exits once the queue is empty.
async fn run_pusher(conn: Arc<Connection>) {
    let mut closed = conn.closed_signal();
    let mut failed = false;

    loop {
        if conn.deps().cancel.cancel_in_progress().is_some() || !conn.is_connected() {
            failed = true;
            break;
        }

        let ceiling = conn.async_max_queue_size.load(Ordering::SeqCst);
        let queued = conn.queue.queued_bytes();
        if queued > ceiling {
            warn!(
                "queued bytes {} exceed the ceiling of {} - asking the slow receiver {:?} to disconnect",
                queued,
                ceiling,
                conn.remote_addr()
            );
            conn.deps().stats.inc_async_queue_size_exceeded();
            conn.disconnect_slow_receiver().await;
            failed = true;
            break;
        }

        let buf = match conn.queue.take() {
            // a clean drain already lowered `queuing_in_progress`; nothing to clean up
            TakeOutcome::Drained => break,
            TakeOutcome::Buffer(buf) => buf,
        };

        let queue_timeout = Duration::from_millis(conn.async_queue_timeout_ms.load(Ordering::SeqCst));
        let mut guard = conn.write_half.lock().await;
        let Some(out) = guard.as_mut() else {
            failed = true;
            break;
        };

        let outcome = tokio::select! {
            res = tokio::time::timeout(queue_timeout, out.write_all(&buf)) => res,
            _ = closed.changed() => {
                failed = true;
                break;
            }
        };
        drop(guard);

        match outcome {
            Err(_elapsed) => {
                warn!(
                    "socket to {:?} accepted nothing for {:?} - asking the slow receiver to disconnect",
                    conn.remote_addr(),
                    queue_timeout
                );
                conn.deps().stats.inc_async_queue_timeouts();
                conn.disconnect_slow_receiver().await;
                failed = true;
                break;
            }
            Ok(Err(e)) => {
                if is_ignorable_io_error(&e) {
                    debug!("pusher write to {:?} failed: {}", conn.remote_addr(), e);
                } else {
                    warn!("pusher write to {:?} failed: {}", conn.remote_addr(), e);
                }
                conn.request_close("pusher write failure").await;
                failed = true;
                break;
            }
            Ok(Ok(())) => {
                conn.mark_accessed();
            }
        }
    }

    if failed {
        // fail outstanding writes; producers waiting on the flush wake up
        conn.queue.shutdown();
    }
}
