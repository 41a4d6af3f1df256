//! File consistency engine.
//!
//! Peers agree on content through a [`ContentManifest`](manifest::ContentManifest).
//! A client whose content differs from the server's downloads the missing
//! files before it joins. The same fragment stream carries the gamestate
//! snapshot to joining and resynchronizing clients under the reserved id
//! [`GAMESTATE_FILE_ID`].
//!
//! ```text
//!  client                                  server
//!    │── TELLFILESNEEDED { first } ───────────►│
//!    │◄──────────── MOREFILESNEEDED { more } ──│   (repeat while `more`)
//!    │── REQUESTFILE { indices } ─────────────►│
//!    │◄──────────────── FILEFRAGMENT × n ──────│   (unreliable, paced)
//!    │── FILEACK { segments } ────────────────►│   (each tic with new data)
//!    │── FILERECEIVED { id, iteration } ──────►│
//! ```

use std::fmt;

pub mod manifest;
pub mod receiver;
pub mod sender;
pub mod store;

/// File id reserved for the gamestate snapshot.
pub const GAMESTATE_FILE_ID: u8 = 255;

/// Errors raised by the file engine and content stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// A manifest index does not exist.
    UnknownFile {
        /// The requested index.
        index: u8,
    },
    /// The sender no longer has the file.
    MissingSource {
        /// File name.
        name: String,
    },
    /// A downloaded file does not match its manifest entry.
    DigestMismatch {
        /// File name.
        name: String,
    },
    /// No progress for longer than the transfer timeout.
    Stalled {
        /// The stalled file id.
        file_id: u8,
    },
    /// A file exceeds the transferable size.
    TooLarge {
        /// File name.
        name: String,
        /// Its size in bytes.
        size: u64,
    },
    /// A file name cannot be used by the store.
    InvalidName {
        /// File name.
        name: String,
    },
    /// The backing storage failed.
    Io {
        /// A description of the failure.
        context: String,
    },
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFile { index } => write!(f, "no manifest entry {}", index),
            Self::MissingSource { name } => write!(f, "file {} is not available", name),
            Self::DigestMismatch { name } => {
                write!(f, "file {} does not match its manifest entry", name)
            },
            Self::Stalled { file_id } => write!(f, "transfer of file {} stalled", file_id),
            Self::TooLarge { name, size } => write!(f, "file {} is too large ({} bytes)", name, size),
            Self::InvalidName { name } => write!(f, "invalid file name {:?}", name),
            Self::Io { context } => write!(f, "storage error: {}", context),
        }
    }
}

impl std::error::Error for TransferError {}

/// Returns `true` if `next` is a later iteration than `current`, with wrapping.
#[inline]
#[must_use]
pub(crate) const fn iteration_is_newer(next: u8, current: u8) -> bool {
    (next.wrapping_sub(current) as i8) > 0
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
    fn iterations_wrap() {
        assert!(iteration_is_newer(1, 0));
        assert!(iteration_is_newer(0, 255));
        assert!(!iteration_is_newer(5, 5));
        assert!(!iteration_is_newer(4, 5));
    }

    #[test]
    fn transfer_error_display() {
        let err = TransferError::Stalled { file_id: 3 };
        assert_eq!(err.to_string(), "transfer of file 3 stalled");
    }
}
