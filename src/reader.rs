use std::io;
use std::sync::Arc;

use bytes::Buf;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::chunk_assembler::ChunkAssemblers;
use crate::connection::Connection;
use crate::error::ConnectionError;
use crate::io_filter::is_ignorable_io_error;
use crate::msg_header::MsgHeader;

enum ReaderExit {
    /// thread-owned sender connection: the handshake reply is in, nothing left to read
    HandshakeDone,
    Eof,
    Cancelled(String),
    Io(io::Error),
    Protocol(ConnectionError),
    CloseRequested(String),
}

/// The one reader task of a connection. Reads into the leased receive buffer, frames
///  messages, and routes them: handshake first, then dispatch or reassembly. Exits close
///  the connection; the lease is released when the task truly ends.
pub(crate) async fn run_reader(conn: Arc<Connection>) {
    let mut lease = match conn.buffer_vendor().lease("reader") {
        Ok(lease) => lease,
        Err(e) => {
            debug!("reader for {:?} could not lease the receive buffer: {}", conn.remote_addr(), e);
            conn.request_close("no receive buffer").await;
            return;
        }
    };
    let Some(mut read_half) = conn.take_read_half() else {
        // close already took the socket
        return;
    };

    let mut closed = conn.closed_signal();
    let mut assemblers = ChunkAssemblers::new(conn.config().max_assembled_size);
    let mut pending_header: Option<MsgHeader> = None;

    let exit = 'read: loop {
        // drain every complete frame already buffered
        loop {
            if pending_header.is_none() {
                if lease.len() < MsgHeader::SERIALIZED_LEN {
                    break;
                }
                let mut header_bytes = &(*lease)[..MsgHeader::SERIALIZED_LEN];
                match MsgHeader::deser(&mut header_bytes) {
                    Ok(header) => {
                        lease.advance(MsgHeader::SERIALIZED_LEN);
                        pending_header = Some(header);
                    }
                    Err(e) => break 'read ReaderExit::Protocol(e),
                }
            }

            let header = pending_header.expect("just parsed or still cached");
            let payload_len = header.payload_len as usize;
            if lease.len() < payload_len {
                // not all payload bytes are in yet; make sure they can fit
                lease.ensure_room(payload_len - lease.len());
                break;
            }
            let payload = lease.split_to(payload_len).freeze();
            pending_header = None;

            if !conn.handshake_read() {
                if conn.is_receiver() {
                    if let Err(reason) = conn.on_handshake_preamble(payload).await {
                        break 'read ReaderExit::CloseRequested(reason);
                    }
                } else {
                    match conn.on_handshake_reply(payload) {
                        Err(reason) => break 'read ReaderExit::CloseRequested(reason),
                        Ok(reader_done) => {
                            if reader_done {
                                break 'read ReaderExit::HandshakeDone;
                            }
                            conn.mark_handshake_read();
                        }
                    }
                }
                continue;
            }

            if let Err(e) = conn.on_message_frame(header, payload, &mut assemblers).await {
                break 'read ReaderExit::Protocol(e);
            }
        }

        if let Some(reason) = conn.deps().cancel.cancel_in_progress() {
            break ReaderExit::Cancelled(reason);
        }

        lease.ensure_room(crate::config::SMALL_BUFFER_SIZE);
        conn.enter_reading_state();
        let read_result = tokio::select! {
            r = read_half.read_buf(&mut *lease) => r,
            _ = closed.changed() => {
                conn.leave_reading_state();
                break ReaderExit::Cancelled("connection closed".to_string());
            }
        };
        conn.leave_reading_state();

        if let Some(reason) = conn.deps().cancel.cancel_in_progress() {
            break ReaderExit::Cancelled(reason);
        }
        match read_result {
            Ok(0) => break ReaderExit::Eof,
            Ok(_) => {}
            Err(e) => break ReaderExit::Io(e),
        }
    };

    match exit {
        ReaderExit::HandshakeDone => {
            // the socket stays usable for direct-ack reads: release the buffer lease and
            //  return the read half before waking the connect waiter
            drop(lease);
            conn.put_back_read_half(read_half);
            conn.mark_handshake_read();
            return;
        }
        ReaderExit::Cancelled(reason) => {
            debug!("reader for {:?} ending: {}", conn.remote_addr(), reason);
            conn.request_close(&reason).await;
        }
        ReaderExit::Eof => {
            debug!("peer {:?} closed the socket", conn.remote_addr());
            initiate_suspicion(&conn, "the peer closed the failure-detection socket").await;
            conn.request_close("peer closed the socket").await;
        }
        ReaderExit::Io(e) => {
            if is_ignorable_io_error(&e) {
                debug!("reader for {:?} got {}", conn.remote_addr(), e);
            } else {
                warn!("reader for {:?} failed: {}", conn.remote_addr(), e);
            }
            initiate_suspicion(&conn, "i/o failure on the failure-detection socket").await;
            conn.request_close(&format!("read failure: {}", e)).await;
        }
        ReaderExit::Protocol(e) => {
            warn!("closing connection to {:?} on a protocol error: {}", conn.remote_addr(), e);
            initiate_suspicion(&conn, "protocol failure on the failure-detection socket").await;
            conn.request_close(&format!("protocol error: {}", e)).await;
        }
        ReaderExit::CloseRequested(reason) => {
            conn.request_close(&reason).await;
        }
    }
}

/// A dying shared unordered link is the cluster's failure-detection channel; losing it is
///  itself a reason to probe the remote.
async fn initiate_suspicion(conn: &Arc<Connection>, reason: &str) {
    if !(conn.shared_resource() && !conn.preserve_order()) {
        return;
    }
    let Some(remote) = conn.remote() else {
        return;
    };
    conn.deps().membership.suspect_member(remote, reason.to_string()).await;
}
