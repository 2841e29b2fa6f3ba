//! Transfer error taxonomy.
//!
//! Every failure surfaced to a caller carries enough context (file name,
//! range or sequence number, expected vs actual sizes) to diagnose from the
//! logs alone. Recovery policy lives at the channel/session boundary — the
//! dispatcher and scheduler processes never die on a bad transfer.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    /// Server unreachable. The session is aborted; no automatic retry.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A bounded wait elapsed (datagram receive, data-channel accept, …).
    #[error("timed out waiting for {what}")]
    Timeout { what: String },

    /// The per-sequence retry budget ran out on the datagram binding.
    #[error("{file}: no valid response for sequence {seq} after {attempts} attempts")]
    RetriesExhausted {
        file: String,
        seq: u64,
        attempts: u32,
    },

    /// Assembled artifact does not match the size announced by the catalog.
    #[error("{file}: size mismatch after reassembly (expected {expected} bytes, got {actual})")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    /// Peer sent something the codec does not recognize.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote answered with an explicit `ERROR|…` message.
    #[error("server error: {0}")]
    Server(String),

    /// Shutdown was requested while the operation was in flight.
    #[error("operation canceled")]
    Canceled,

    /// A channel temp file expected during reassembly is missing.
    #[error("missing channel part {}", path.display())]
    MissingPart { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// True for failures worth retrying on a later scheduler pass.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TransferError::Canceled | TransferError::Protocol(_))
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability_split() {
        assert!(TransferError::Timeout {
            what: "reply".into()
        }
        .is_recoverable());
        assert!(TransferError::RetriesExhausted {
            file: "a.txt".into(),
            seq: 3,
            attempts: 6,
        }
        .is_recoverable());
        assert!(!TransferError::Canceled.is_recoverable());
        assert!(!TransferError::Protocol("bad frame".into()).is_recoverable());
    }

    #[test]
    fn test_messages_carry_context() {
        let e = TransferError::SizeMismatch {
            file: "b.bin".into(),
            expected: 2_000_000,
            actual: 1_999_872,
        };
        let message = e.to_string();
        assert!(message.contains("b.bin"));
        assert!(message.contains("2000000"));
        assert!(message.contains("1999872"));
    }
}
