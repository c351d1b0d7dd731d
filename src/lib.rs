//! Incremental state transfer for multi-primary replication clusters.
//!
//! When a node rejoins a cluster it is missing a contiguous, totally ordered
//! range of replication events. A donor node streams that range from its
//! write-set cache over TCP (optionally TLS); the joiner feeds each event to
//! its apply handler, classified as apply / certification-preload /
//! already-covered-by-snapshot. This crate implements the sender and
//! receiver endpoints of that protocol, the fair per-segment send queue used
//! by the group transport underneath it, and the primary-component
//! membership message codec that gates when a transfer may begin.

#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod ist;
pub mod pc;
pub mod sendq;
pub mod seqno;
pub mod tls;

pub use cache::{CacheError, MemWriteSetCache, WriteSetCache};
pub use config::{Config, ConfigError, Endpoint, Scheme};
pub use error::{EINTR, EINVAL, EIO, EPROTO};
pub use event::{Event, EventHandler, EventKind, TrxHandle, TrxPool};
pub use ist::{AsyncSenderMap, IstError, Receiver, Sender};
pub use pc::{MemberId, PcInst, PcInstMap, PcMessage, PcMessageKind, ViewId};
pub use sendq::FairSendQueue;
pub use seqno::Seqno;
