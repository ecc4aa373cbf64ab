use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use bytes::BytesMut;
use tracing::trace;

/// Lends the single receive buffer of one connection.
///
/// The contract mirrors what the reader task needs: at most one lease is open at a time,
///  the buffer survives lease cycles (the reader may end and a direct-ack read may lease
///  it afterwards), and `destruct` at close reclaims it for good. A sender connection
///  that keeps a residual reader holds its lease until that reader truly exits.
#[derive(Debug)]
pub struct BufferVendor {
    buf_size: usize,
    state: Mutex<VendorState>,
}

#[derive(Debug)]
struct VendorState {
    pooled: Option<BytesMut>,
    leased_to: Option<&'static str>,
    destructed: bool,
}

impl BufferVendor {
    pub fn new(buf_size: usize) -> Arc<BufferVendor> {
        Arc::new(BufferVendor {
            buf_size,
            state: Mutex::new(VendorState {
                pooled: None,
                leased_to: None,
                destructed: false,
            }),
        })
    }

    /// Open the sharing handle. Fails if another owner still holds it or the vendor was
    ///  destructed by close.
    pub fn lease(self: &Arc<Self>, owner: &'static str) -> anyhow::Result<ReceiveBufferLease> {
        let mut state = self.state.lock().unwrap();
        if state.destructed {
            bail!("receive buffer was reclaimed at close");
        }
        if let Some(current) = state.leased_to {
            bail!("receive buffer is already leased to {}", current);
        }
        state.leased_to = Some(owner);

        let buf = match state.pooled.take() {
            Some(buf) => {
                trace!("handing out the pooled receive buffer to {}", owner);
                buf
            }
            None => BytesMut::with_capacity(self.buf_size),
        };

        Ok(ReceiveBufferLease {
            buf,
            vendor: self.clone(),
        })
    }

    pub fn is_leased(&self) -> bool {
        self.state.lock().unwrap().leased_to.is_some()
    }

    /// Reclaim the buffer at connection close. An open lease is not revoked; its buffer is
    ///  simply discarded instead of pooled when the holder lets go.
    pub fn destruct(&self) {
        let mut state = self.state.lock().unwrap();
        state.destructed = true;
        state.pooled = None;
    }

    fn release(&self, mut buf: BytesMut) {
        let mut state = self.state.lock().unwrap();
        state.leased_to = None;
        if !state.destructed {
            buf.clear();
            state.pooled = Some(buf);
        }
    }
}

/// The open sharing handle on a connection's receive buffer. Dereferences to the
///  `BytesMut` the reader fills; growth happens in place via `reserve`.
#[derive(Debug)]
pub struct ReceiveBufferLease {
    buf: BytesMut,
    vendor: Arc<BufferVendor>,
}

impl ReceiveBufferLease {
    /// Make room for at least `additional` more bytes. Reclaims consumed capacity at the
    ///  front of the buffer when possible, grows the allocation otherwise.
    pub fn ensure_room(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }
}

impl Deref for ReceiveBufferLease {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}
impl DerefMut for ReceiveBufferLease {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for ReceiveBufferLease {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.vendor.release(buf);
    }
}
