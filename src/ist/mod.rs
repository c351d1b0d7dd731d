//! Incremental state transfer endpoints.

pub mod proto;
pub mod receiver;
pub mod sender;

use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::error::{EINTR, EINVAL, EIO, EPROTO};
use crate::frame::FrameError;
use crate::seqno::Seqno;

pub use proto::{CTRL_EOF, CTRL_OK, Handshake, HandshakeResponse, Proto, ProtoError};
pub use receiver::Receiver;
pub use sender::{AsyncSenderMap, Sender};

/// Protocol version from which peer certificate verification may be
/// enabled; earlier senders return a null certificate during the TLS
/// handshake.
pub const VER_CERT_AUTH: u32 = 7;

/// Protocol version from which `first > last` means "empty range" instead
/// of a caller bug.
pub const VER_RELAXED_RANGE: u32 = 10;

/// Protocol version this crate speaks.
pub const VER_CURRENT: u32 = 10;

#[derive(Debug, Error)]
pub enum IstError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("handshake rejected by peer: {code}")]
    Rejected { code: i32 },
    #[error("stream started with wrong seqno: {got}, expected <= {first}")]
    FirstSeqno { got: Seqno, first: Seqno },
    #[error("unexpected event seqno: {got}, expected {expected}")]
    Sequence { expected: Seqno, got: Seqno },
    #[error("sender range inverted: {first} > {last}")]
    InvalidRange { first: Seqno, last: Seqno },
    #[error("interrupted")]
    Interrupted,
}

impl IstError {
    /// Map to the errno-style code delivered through `ist_end` and async
    /// sender completion.
    pub fn code(&self) -> i32 {
        match self {
            IstError::Config(_) => EINVAL,
            IstError::InvalidRange { .. } => EINVAL,
            IstError::Io(err) => err.raw_os_error().unwrap_or(EIO),
            IstError::Proto(err) => err.code(),
            IstError::Cache(_) => EPROTO,
            IstError::Rejected { .. } => EPROTO,
            IstError::FirstSeqno { .. } => EPROTO,
            IstError::Sequence { .. } => EPROTO,
            IstError::Interrupted => EINTR,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.code() == EINTR
    }
}

impl From<FrameError> for IstError {
    fn from(err: FrameError) -> Self {
        IstError::Proto(ProtoError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_follow_the_taxonomy() {
        assert_eq!(IstError::Config(ConfigError::AddrNotSet).code(), EINVAL);
        assert_eq!(
            IstError::Sequence {
                expected: Seqno::new(4),
                got: Seqno::new(5)
            }
            .code(),
            EPROTO
        );
        assert_eq!(IstError::Interrupted.code(), EINTR);
        assert!(IstError::Interrupted.is_interrupted());
        assert_eq!(IstError::Proto(ProtoError::Interrupted).code(), EINTR);

        let os_err = std::io::Error::from_raw_os_error(104);
        assert_eq!(IstError::Io(os_err).code(), 104);
        let anon = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(IstError::Io(anon).code(), EIO);
    }
}
