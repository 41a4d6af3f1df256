use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::files::TransferError;
use crate::network::codec::CodecError;
use crate::network::reliability::ReliabilityError;
use crate::trust::TrustError;
use crate::{NodeId, PlayerSlot};

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), NetsyncError>`].
///
/// [`Result<(), NetsyncError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetsyncError {
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// The operation needs a joined session.
    NotJoined,
    /// Every node id is in use.
    DirectoryFull,
    /// A player slot was out of range or not owned by the caller.
    InvalidPlayerSlot {
        /// The offending slot.
        slot: PlayerSlot,
    },
    /// A node handle was stale or the node is not in use.
    InvalidNode {
        /// The offending node.
        node: NodeId,
    },
    /// A packet could not be encoded or decoded.
    Codec(CodecError),
    /// The reliability layer refused a send.
    Reliability(ReliabilityError),
    /// A file transfer failed.
    Transfer(TransferError),
    /// A signing or verification step failed.
    Trust(TrustError),
    /// A network socket operation failed.
    SocketError {
        /// A description of the socket error.
        context: String,
    },
}

impl Display for NetsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetsyncError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            },
            NetsyncError::NotJoined => {
                write!(f, "The session has not joined a server yet.")
            },
            NetsyncError::DirectoryFull => {
                write!(f, "No free node id is available.")
            },
            NetsyncError::InvalidPlayerSlot { slot } => {
                write!(f, "Invalid player slot {}", slot)
            },
            NetsyncError::InvalidNode { node } => {
                write!(f, "Invalid or stale node {}", node)
            },
            NetsyncError::Codec(e) => write!(f, "Codec error: {}", e),
            NetsyncError::Reliability(e) => write!(f, "Reliability error: {}", e),
            NetsyncError::Transfer(e) => write!(f, "Transfer error: {}", e),
            NetsyncError::Trust(e) => write!(f, "Trust error: {}", e),
            NetsyncError::SocketError { context } => {
                write!(f, "Socket error: {}", context)
            },
        }
    }
}

impl Error for NetsyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NetsyncError::Codec(e) => Some(e),
            NetsyncError::Reliability(e) => Some(e),
            NetsyncError::Transfer(e) => Some(e),
            NetsyncError::Trust(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for NetsyncError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<ReliabilityError> for NetsyncError {
    fn from(e: ReliabilityError) -> Self {
        Self::Reliability(e)
    }
}

impl From<TransferError> for NetsyncError {
    fn from(e: TransferError) -> Self {
        Self::Transfer(e)
    }
}

impl From<TrustError> for NetsyncError {
    fn from(e: TrustError) -> Self {
        Self::Trust(e)
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = NetsyncError::InvalidRequest {
            info: "too many local players".to_owned(),
        };
        assert_eq!(err.to_string(), "Invalid Request: too many local players");
    }

    #[test]
    fn wrapped_errors_expose_source() {
        let err = NetsyncError::from(ReliabilityError::Backlog { pending: 64 });
        assert!(err.source().is_some());
        assert!(NetsyncError::NotJoined.source().is_none());
    }
}
