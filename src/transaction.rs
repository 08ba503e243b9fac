//! Multi-part transaction records
//!
//! TRANSACTION and NT_TRANSACT commands may arrive split across a primary
//! request and secondary continuations. The session keeps one record per
//! open transaction, accumulates the parameter and data fragments, and
//! closes every open record when the connection goes away.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Accumulation state for one open transaction
struct TransactionInner {
    params: BytesMut,
    data: BytesMut,
    closed: bool,
}

/// One open multi-part transaction
pub struct Transaction {
    /// Transaction identifier within the session
    pub xid: u16,
    /// Multiplex id the fragments arrive under
    pub mid: u16,
    /// User the transaction runs as
    pub uid: u16,
    /// Tree the transaction targets
    pub tid: u16,
    /// Declared total parameter bytes
    pub total_params: usize,
    /// Declared total data bytes
    pub total_data: usize,
    inner: Mutex<TransactionInner>,
}

impl Transaction {
    /// Open a transaction record from the primary request.
    pub fn new(
        xid: u16,
        mid: u16,
        uid: u16,
        tid: u16,
        total_params: usize,
        total_data: usize,
    ) -> Self {
        Self {
            xid,
            mid,
            uid,
            tid,
            total_params,
            total_data,
            inner: Mutex::new(TransactionInner {
                params: BytesMut::with_capacity(total_params),
                data: BytesMut::with_capacity(total_data),
                closed: false,
            }),
        }
    }

    /// Append a fragment. Returns true when both accumulators have reached
    /// their declared totals, false if more fragments are expected or the
    /// record was closed.
    pub fn append(&self, params: &[u8], data: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.params.extend_from_slice(params);
        inner.data.extend_from_slice(data);
        inner.params.len() >= self.total_params && inner.data.len() >= self.total_data
    }

    /// Take the accumulated fragments for dispatch.
    pub fn take(&self) -> (Bytes, Bytes) {
        let mut inner = self.inner.lock();
        (
            std::mem::take(&mut inner.params).freeze(),
            std::mem::take(&mut inner.data).freeze(),
        )
    }

    /// Close the record; later fragments are refused.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Whether the record has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
