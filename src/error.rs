//! Errno-style result codes crossing the handler boundary.
//!
//! The embedding replication provider consumes completion codes as plain
//! integers: `ist_end(0)` for a clean stream, `EINTR` for an external
//! interrupt, and so on. Async senders likewise report failures upward as
//! negated codes. The constants use the conventional Linux values.

/// Interrupted by an external cancellation.
pub const EINTR: i32 = 4;

/// Generic I/O failure with no preserved OS errno.
pub const EIO: i32 = 5;

/// Invalid configuration or arguments.
pub const EINVAL: i32 = 22;

/// Protocol violation: unexpected message, bad seqno, short stream.
pub const EPROTO: i32 = 71;
