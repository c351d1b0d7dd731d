//! Replication events and the apply-handler seam.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::seqno::Seqno;

/// What kind of ordered event a stream entry carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A replicated transaction write-set.
    WriteSet,
    /// A cluster configuration change.
    ConfChange,
}

/// One ordered replication event with an opaque payload.
///
/// Payloads are never interpreted by the transfer engine; write-set
/// deserialisation and configuration-change parsing happen in the handler.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub seqno: Seqno,
    pub kind: EventKind,
    pub payload: Bytes,
}

impl Event {
    pub fn writeset(seqno: Seqno, payload: Bytes) -> Self {
        Event {
            seqno,
            kind: EventKind::WriteSet,
            payload,
        }
    }

    pub fn conf_change(seqno: Seqno, payload: Bytes) -> Self {
        Event {
            seqno,
            kind: EventKind::ConfChange,
            payload,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Callbacks through which received events reach the replication state
/// machine.
///
/// `must_apply` is false for events whose effects were already materialised
/// by the snapshot transfer; they are delivered anyway so the joiner's
/// write-set cache stays seqno-contiguous. `preload` marks events that feed
/// the certification index without being applied.
pub trait EventHandler: Send + Sync {
    /// A write-set event, wrapped in a pooled slave transaction handle.
    fn ist_trx(&self, trx: TrxHandle, must_apply: bool, preload: bool);

    /// A configuration-change event, raw bytes.
    fn ist_cc(&self, event: Event, must_apply: bool, preload: bool);

    /// Final notification, delivered exactly once per transfer.
    /// `0` on clean EOF, [`crate::error::EINTR`] on external interrupt,
    /// another errno-style code on failure.
    fn ist_end(&self, error_code: i32);
}

/// Allocator for slave transaction handles.
///
/// Handles are cheap; the pool exists so the embedding provider can observe
/// how many are outstanding at any point of a transfer.
#[derive(Clone, Default)]
pub struct TrxPool {
    stats: Arc<TrxPoolStats>,
}

#[derive(Default)]
struct TrxPoolStats {
    allocated: AtomicU64,
    outstanding: AtomicU64,
}

impl TrxPool {
    pub fn new() -> Self {
        TrxPool::default()
    }

    pub fn alloc(&self) -> TrxHandle {
        self.stats.allocated.fetch_add(1, Ordering::Relaxed);
        self.stats.outstanding.fetch_add(1, Ordering::Relaxed);
        TrxHandle {
            stats: Arc::clone(&self.stats),
            seqno: Seqno::UNDEFINED,
            payload: Bytes::new(),
            local: false,
            dummy: false,
        }
    }

    /// Total handles ever allocated.
    pub fn allocated(&self) -> u64 {
        self.stats.allocated.load(Ordering::Relaxed)
    }

    /// Handles currently alive.
    pub fn outstanding(&self) -> u64 {
        self.stats.outstanding.load(Ordering::Relaxed)
    }
}

/// A slave-side transaction handle built from a streamed write-set.
pub struct TrxHandle {
    stats: Arc<TrxPoolStats>,
    seqno: Seqno,
    payload: Bytes,
    local: bool,
    dummy: bool,
}

impl TrxHandle {
    /// Adopt a streamed write-set. The transaction is marked non-local;
    /// checksum verification happens later in the apply pipeline.
    pub fn unserialize(&mut self, event: &Event) {
        debug_assert_eq!(event.kind, EventKind::WriteSet);
        self.seqno = event.seqno;
        self.payload = event.payload.clone();
        self.local = false;
        self.dummy = false;
    }

    /// Adopt a payload-less event as a dummy placeholder carrying only the
    /// seqno.
    pub fn mark_dummy(&mut self, event: &Event) {
        debug_assert!(event.is_empty());
        self.seqno = event.seqno;
        self.payload = event.payload.clone();
        self.dummy = true;
    }

    pub fn global_seqno(&self) -> Seqno {
        self.seqno
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_dummy(&self) -> bool {
        self.dummy
    }
}

impl Drop for TrxHandle {
    fn drop(&mut self) {
        self.stats.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unserialize_marks_non_local() {
        let pool = TrxPool::new();
        let mut trx = pool.alloc();
        trx.unserialize(&Event::writeset(Seqno::new(7), Bytes::from_static(b"ws")));
        assert_eq!(trx.global_seqno(), Seqno::new(7));
        assert!(!trx.is_local());
        assert!(!trx.is_dummy());
    }

    #[test]
    fn empty_payload_becomes_dummy() {
        let pool = TrxPool::new();
        let mut trx = pool.alloc();
        trx.mark_dummy(&Event::writeset(Seqno::new(3), Bytes::new()));
        assert!(trx.is_dummy());
        assert_eq!(trx.global_seqno(), Seqno::new(3));
    }

    #[test]
    fn pool_tracks_outstanding_handles() {
        let pool = TrxPool::new();
        let a = pool.alloc();
        let b = pool.alloc();
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.outstanding(), 2);
        drop(a);
        assert_eq!(pool.outstanding(), 1);
        drop(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.allocated(), 2);
    }
}
