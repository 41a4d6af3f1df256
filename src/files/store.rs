//! Where content files are read from and written to.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::files::manifest::FileEntry;
use crate::files::TransferError;

/// Storage for content files.
///
/// The server reads files it serves from its store; a client writes the files
/// it downloads into its store.
#[cfg(feature = "sync-send")]
pub trait ContentStore: Send + Sync {
    /// Reads a whole file.
    fn read(&self, name: &str) -> Result<Vec<u8>, TransferError>;

    /// Writes a whole file, replacing any previous content.
    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), TransferError>;

    /// Returns `true` if the store holds exactly the content `entry` describes.
    fn contains(&self, entry: &FileEntry) -> bool {
        self.read(&entry.name).is_ok_and(|data| entry.matches(&data))
    }
}

/// Storage for content files.
///
/// The server reads files it serves from its store; a client writes the files
/// it downloads into its store.
#[cfg(not(feature = "sync-send"))]
pub trait ContentStore {
    /// Reads a whole file.
    fn read(&self, name: &str) -> Result<Vec<u8>, TransferError>;

    /// Writes a whole file, replacing any previous content.
    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), TransferError>;

    /// Returns `true` if the store holds exactly the content `entry` describes.
    fn contains(&self, entry: &FileEntry) -> bool {
        self.read(&entry.name).is_ok_and(|data| entry.matches(&data))
    }
}

/// In-memory store, mostly for tests and for games that load content from archives.
#[derive(Debug, Clone, Default)]
pub struct MemoryContentStore {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryContentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file.
    pub fn insert(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.files.insert(name.into(), data);
    }

    /// Number of stored files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` if no file is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl ContentStore for MemoryContentStore {
    fn read(&self, name: &str) -> Result<Vec<u8>, TransferError> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| TransferError::MissingSource {
                name: name.to_owned(),
            })
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), TransferError> {
        self.files.insert(name.to_owned(), data.to_vec());
        Ok(())
    }
}

/// Store backed by one flat directory on disk.
///
/// Names containing path separators or parent references are rejected, so a
/// remote manifest can never address files outside the directory.
#[derive(Debug, Clone)]
pub struct DirectoryContentStore {
    root: PathBuf,
}

impl DirectoryContentStore {
    /// Uses `root` as the content directory. It is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The content directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf, TransferError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0'])
            && !name.starts_with('.');
        if !valid {
            return Err(TransferError::InvalidName {
                name: name.to_owned(),
            });
        }
        Ok(self.root.join(name))
    }
}

impl ContentStore for DirectoryContentStore {
    fn read(&self, name: &str) -> Result<Vec<u8>, TransferError> {
        let path = self.path_of(name)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TransferError::MissingSource {
                name: name.to_owned(),
            },
            _ => TransferError::Io {
                context: format!("reading {}: {}", path.display(), e),
            },
        })
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), TransferError> {
        let path = self.path_of(name)?;
        std::fs::create_dir_all(&self.root).map_err(|e| TransferError::Io {
            context: format!("creating {}: {}", self.root.display(), e),
        })?;
        std::fs::write(&path, data).map_err(|e| TransferError::Io {
            context: format!("writing {}: {}", path.display(), e),
        })?;
        tracing::debug!(path = %path.display(), bytes = data.len(), "content file written");
        Ok(())
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
    fn memory_store_roundtrip_and_contains() {
        let mut store = MemoryContentStore::new();
        store.write("a.pk3", b"abc").unwrap();
        assert_eq!(store.read("a.pk3").unwrap(), b"abc");
        assert!(store.contains(&FileEntry::describe("a.pk3", b"abc")));
        assert!(!store.contains(&FileEntry::describe("a.pk3", b"abd")));
        assert!(matches!(
            store.read("missing"),
            Err(TransferError::MissingSource { .. })
        ));
    }

    #[test]
    fn directory_store_rejects_escaping_names() {
        let store = DirectoryContentStore::new(std::env::temp_dir());
        for name in ["../etc/passwd", "a/b", "..", "", ".hidden", "c:\\x"] {
            assert!(matches!(
                store.read(name),
                Err(TransferError::InvalidName { .. })
            ));
        }
    }

    #[test]
    fn directory_store_writes_and_reads_back() {
        let root = std::env::temp_dir().join(format!("kart-netsync-store-{}", std::process::id()));
        let mut store = DirectoryContentStore::new(&root);
        store.write("track.pk3", b"track bytes").unwrap();
        assert_eq!(store.read("track.pk3").unwrap(), b"track bytes");
        assert!(matches!(
            store.read("other.pk3"),
            Err(TransferError::MissingSource { .. })
        ));
        std::fs::remove_dir_all(&root).unwrap();
    }
}
