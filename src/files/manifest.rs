//! The list of content files every peer must have loaded.

use serde::{Deserialize, Serialize};
use std::hash::Hasher;

use crate::files::store::ContentStore;
use crate::hash::{fnv1a_bytes, DeterministicHasher};
use crate::network::messages::{MAX_FILENAME_LENGTH, MAX_FILES_PER_PACKET};

/// One content file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEntry {
    /// File name, unique within a manifest.
    pub name: String,
    /// Size in bytes.
    pub size: u32,
    /// FNV-1a digest of the contents.
    pub digest: u64,
}

impl FileEntry {
    /// Creates an entry from its parts.
    #[must_use]
    pub fn new(name: impl Into<String>, size: u32, digest: u64) -> Self {
        Self {
            name: name.into(),
            size,
            digest,
        }
    }

    /// Describes `data` under `name`.
    #[must_use]
    pub fn describe(name: impl Into<String>, data: &[u8]) -> Self {
        Self::new(name, data.len() as u32, fnv1a_bytes(data))
    }

    /// Returns `true` if `data` is the content this entry describes.
    #[must_use]
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() == self.size as usize && fnv1a_bytes(data) == self.digest
    }

    // Fixed fields plus the length-prefixed name, as laid out by the codec.
    fn encoded_len(&self) -> usize {
        8 + self.name.len() + 4 + 8
    }
}

/// Ordered list of content files.
///
/// ```
/// use kart_netsync::{ContentManifest, FileEntry};
///
/// let manifest = ContentManifest::new(vec![
///     FileEntry::describe("main.pk3", b"base content"),
///     FileEntry::describe("tracks.pk3", b"extra tracks"),
/// ]);
/// let reordered = ContentManifest::new(vec![
///     FileEntry::describe("tracks.pk3", b"extra tracks"),
///     FileEntry::describe("main.pk3", b"base content"),
/// ]);
/// assert_ne!(manifest.checksum(), reordered.checksum());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentManifest {
    entries: Vec<FileEntry>,
}

impl ContentManifest {
    /// Creates a manifest. Load order is significant.
    #[must_use]
    pub fn new(entries: Vec<FileEntry>) -> Self {
        Self { entries }
    }

    /// Every entry, in load order.
    #[must_use]
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// The entry at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&FileEntry> {
        self.entries.get(index)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the manifest lists no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deterministic checksum over names, sizes and digests, in order.
    #[must_use]
    pub fn checksum(&self) -> u64 {
        let mut hasher = DeterministicHasher::new();
        hasher.write_u64(self.entries.len() as u64);
        for entry in &self.entries {
            hasher.write_str_prefixed(&entry.name);
            hasher.write_u32(entry.size);
            hasher.write_u64(entry.digest);
        }
        hasher.finish()
    }

    /// Entries starting at `first` that fit in `byte_budget` encoded bytes,
    /// at most [`MAX_FILES_PER_PACKET`] of them, and whether more follow.
    ///
    /// At least one entry is returned when any remain, so paging always
    /// makes progress.
    #[must_use]
    pub fn page(&self, first: usize, byte_budget: usize) -> (Vec<FileEntry>, bool) {
        let mut page = Vec::new();
        let mut used = 0;
        for entry in self.entries.iter().skip(first) {
            let len = entry.encoded_len();
            if !page.is_empty() && (used + len > byte_budget || page.len() == MAX_FILES_PER_PACKET)
            {
                break;
            }
            used += len;
            page.push(entry.clone());
        }
        let more = first + page.len() < self.entries.len();
        (page, more)
    }

    /// Manifest indices of the files `store` lacks or holds with different content.
    #[must_use]
    pub fn missing_from<S: ContentStore + ?Sized>(&self, store: &S) -> Vec<u8> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !store.contains(entry))
            .filter_map(|(index, _)| u8::try_from(index).ok())
            .collect()
    }

    /// Returns `true` if every name fits on the wire and indices fit in a file id.
    #[must_use]
    pub fn is_transferable(&self) -> bool {
        self.entries.len() < usize::from(crate::files::GAMESTATE_FILE_ID)
            && self
                .entries
                .iter()
                .all(|entry| entry.name.len() <= MAX_FILENAME_LENGTH)
    }
}

impl FromIterator<FileEntry> for ContentManifest {
    fn from_iter<T: IntoIterator<Item = FileEntry>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
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
    use crate::files::store::MemoryContentStore;

    fn manifest(count: usize) -> ContentManifest {
        (0..count)
            .map(|i| FileEntry::describe(format!("addon{:03}.pk3", i), format!("data {}", i).as_bytes()))
            .collect()
    }

    #[test]
    fn checksum_depends_on_content() {
        let a = ContentManifest::new(vec![FileEntry::describe("a.pk3", b"one")]);
        let b = ContentManifest::new(vec![FileEntry::describe("a.pk3", b"two")]);
        assert_ne!(a.checksum(), b.checksum());
        assert_eq!(a.checksum(), a.clone().checksum());
        assert_ne!(ContentManifest::default().checksum(), a.checksum());
    }

    #[test]
    fn paging_returns_whole_manifest_without_overlap() {
        let manifest = manifest(100);
        let mut collected = Vec::new();
        let mut more = true;
        while more {
            let (page, has_more) = manifest.page(collected.len(), 600);
            assert!(!page.is_empty());
            assert!(page.len() <= MAX_FILES_PER_PACKET);
            collected.extend(page);
            more = has_more;
        }
        assert_eq!(collected, manifest.entries());
    }

    #[test]
    fn page_past_the_end_is_empty() {
        let (page, more) = manifest(3).page(3, 1000);
        assert!(page.is_empty());
        assert!(!more);
    }

    #[test]
    fn missing_files_are_detected_by_digest() {
        let manifest = ContentManifest::new(vec![
            FileEntry::describe("a.pk3", b"alpha"),
            FileEntry::describe("b.pk3", b"beta"),
            FileEntry::describe("c.pk3", b"gamma"),
        ]);
        let mut store = MemoryContentStore::new();
        store.insert("a.pk3", b"alpha".to_vec());
        store.insert("b.pk3", b"BETA".to_vec());
        assert_eq!(manifest.missing_from(&store), vec![1, 2]);
    }
}
