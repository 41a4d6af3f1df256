//! Incoming file transfers from one node.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use crate::files::{iteration_is_newer, TransferError};
use crate::network::messages::{AckSegment, FileAckBody, FileFragmentBody, MAX_ACK_SEGMENTS};
use crate::Tic;

const GROUP_BITS: usize = 32;

/// Largest file a receiver accepts unless configured otherwise.
pub const DEFAULT_MAX_FILE_SIZE: u32 = 64 * 1024 * 1024;

/// Result of handing one fragment to the receiver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// New data was stored.
    Accepted,
    /// The fragment was already stored.
    Duplicate,
    /// The fragment belongs to an older iteration and was dropped.
    StaleIteration,
    /// The fragment is malformed or for a file that is not expected.
    Invalid,
    /// The fragment completed the file.
    Completed,
}

/// Fragment indices acknowledged by `segments`, in segment order.
pub(crate) fn acked_fragments(segments: &[AckSegment]) -> impl Iterator<Item = usize> + '_ {
    segments.iter().flat_map(|segment| {
        (0..GROUP_BITS)
            .filter(move |bit| segment.mask & (1 << bit) != 0)
            .map(move |bit| segment.start as usize + bit)
    })
}

/// Byte ranges of a file covered by acknowledged fragments, merged and sorted.
///
/// ```
/// use kart_netsync::__internal::{segments_to_byte_ranges, AckSegment};
///
/// let segments = [AckSegment { start: 0, mask: 0b1011 }];
/// assert_eq!(segments_to_byte_ranges(&segments, 100, 350), vec![0..200, 300..350]);
/// ```
#[must_use]
pub fn segments_to_byte_ranges(
    segments: &[AckSegment],
    fragment_size: usize,
    file_size: usize,
) -> Vec<Range<usize>> {
    let mut fragments: Vec<usize> = acked_fragments(segments).collect();
    fragments.sort_unstable();
    fragments.dedup();
    let mut ranges: Vec<Range<usize>> = Vec::new();
    for index in fragments {
        let start = index.saturating_mul(fragment_size);
        if start >= file_size {
            continue;
        }
        let end = (start + fragment_size).min(file_size);
        match ranges.last_mut() {
            Some(last) if last.end == start => last.end = end,
            _ => ranges.push(start..end),
        }
    }
    ranges
}

#[derive(Debug)]
struct IncomingTransfer {
    expected_size: u32,
    iteration: Option<u8>,
    fragment_size: usize,
    data: Vec<u8>,
    received: Vec<bool>,
    remaining: usize,
    dirty_groups: BTreeSet<usize>,
    last_progress: Tic,
}

impl IncomingTransfer {
    fn reset(&mut self, iteration: u8, fragment_size: usize) {
        let fragments = (self.expected_size as usize).div_ceil(fragment_size).max(1);
        self.iteration = Some(iteration);
        self.fragment_size = fragment_size;
        self.data = vec![0; self.expected_size as usize];
        self.received = vec![false; fragments];
        self.remaining = fragments;
        self.dirty_groups.clear();
    }

    fn segment(&self, group: usize) -> AckSegment {
        let start = group * GROUP_BITS;
        let mask = (0..GROUP_BITS)
            .filter(|bit| self.received.get(start + bit).copied().unwrap_or(false))
            .fold(0u32, |mask, bit| mask | (1 << bit));
        AckSegment {
            start: start as u32,
            mask,
        }
    }
}

/// Reassembles every file being received from one node.
///
/// A file id must be announced with [`expect`](Self::expect) before its
/// fragments are accepted. The first fragment fixes the iteration; a fragment
/// of a newer iteration restarts the file from scratch, older ones are dropped.
#[derive(Debug)]
pub struct FileReceiver {
    transfers: BTreeMap<u8, IncomingTransfer>,
    max_file_size: u32,
}

impl Default for FileReceiver {
    fn default() -> Self {
        Self::with_max_file_size(DEFAULT_MAX_FILE_SIZE)
    }
}

impl FileReceiver {
    /// Creates a receiver expecting nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a receiver that refuses files larger than `max_file_size` bytes.
    #[must_use]
    pub fn with_max_file_size(max_file_size: u32) -> Self {
        Self {
            transfers: BTreeMap::new(),
            max_file_size,
        }
    }

    /// Announces that `file_id` of `size` bytes is about to arrive.
    ///
    /// # Errors
    /// Returns [`TransferError::TooLarge`] if `size` exceeds the receiver's
    /// limit. Nothing is allocated for a refused file.
    pub fn expect(&mut self, file_id: u8, size: u32, now: Tic) -> Result<(), TransferError> {
        if size > self.max_file_size {
            return Err(TransferError::TooLarge {
                name: format!("#{}", file_id),
                size: u64::from(size),
            });
        }
        self.transfers.insert(
            file_id,
            IncomingTransfer {
                expected_size: size,
                iteration: None,
                fragment_size: 0,
                data: Vec::new(),
                received: Vec::new(),
                remaining: 1,
                dirty_groups: BTreeSet::new(),
                last_progress: now,
            },
        );
        Ok(())
    }

    /// Stores one fragment.
    pub fn on_fragment(&mut self, fragment: &FileFragmentBody, now: Tic) -> FragmentOutcome {
        let Some(transfer) = self.transfers.get_mut(&fragment.file_id) else {
            return FragmentOutcome::Invalid;
        };
        let fragment_size = usize::from(fragment.fragment_size);
        if fragment.file_size != transfer.expected_size || fragment_size == 0 {
            return FragmentOutcome::Invalid;
        }
        match transfer.iteration {
            Some(current) if current == fragment.iteration => {
                if transfer.fragment_size != fragment_size {
                    return FragmentOutcome::Invalid;
                }
            },
            Some(current) if !iteration_is_newer(fragment.iteration, current) => {
                return FragmentOutcome::StaleIteration;
            },
            Some(current) => {
                tracing::debug!(
                    file_id = fragment.file_id,
                    from = current,
                    to = fragment.iteration,
                    "file transfer restarted by sender"
                );
                transfer.reset(fragment.iteration, fragment_size);
            },
            None => transfer.reset(fragment.iteration, fragment_size),
        }

        let position = fragment.position as usize;
        if position % fragment_size != 0 {
            return FragmentOutcome::Invalid;
        }
        let index = position / fragment_size;
        let Some(received) = transfer.received.get(index).copied() else {
            return FragmentOutcome::Invalid;
        };
        let expected_len = (transfer.data.len() - position.min(transfer.data.len())).min(fragment_size);
        if fragment.data.len() != expected_len {
            return FragmentOutcome::Invalid;
        }

        transfer.dirty_groups.insert(index / GROUP_BITS);
        if received {
            return FragmentOutcome::Duplicate;
        }
        transfer.data[position..position + expected_len].copy_from_slice(&fragment.data);
        transfer.received[index] = true;
        transfer.remaining -= 1;
        transfer.last_progress = now;
        if transfer.remaining == 0 {
            FragmentOutcome::Completed
        } else {
            FragmentOutcome::Accepted
        }
    }

    /// Acknowledgments for every group that received fragments since the last call.
    pub fn take_acks(&mut self) -> Vec<FileAckBody> {
        let mut acks = Vec::new();
        for (&file_id, transfer) in &mut self.transfers {
            let Some(iteration) = transfer.iteration else {
                continue;
            };
            let groups = std::mem::take(&mut transfer.dirty_groups);
            let segments: Vec<AckSegment> = groups.iter().map(|g| transfer.segment(*g)).collect();
            for chunk in segments.chunks(MAX_ACK_SEGMENTS) {
                acks.push(FileAckBody {
                    file_id,
                    iteration,
                    segments: chunk.to_vec(),
                });
            }
        }
        acks
    }

    /// Removes and returns a finished file with its iteration.
    pub fn take_completed(&mut self, file_id: u8) -> Option<(u8, Vec<u8>)> {
        let done = self
            .transfers
            .get(&file_id)
            .is_some_and(|t| t.iteration.is_some() && t.remaining == 0);
        if !done {
            return None;
        }
        let transfer = self.transfers.remove(&file_id)?;
        Some((transfer.iteration?, transfer.data))
    }

    /// File ids that received nothing new for `timeout_tics`.
    #[must_use]
    pub fn stalled(&self, now: Tic, timeout_tics: u32) -> Vec<u8> {
        self.transfers
            .iter()
            .filter(|(_, t)| t.remaining > 0 && now - t.last_progress >= i64::from(timeout_tics))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Byte ranges of `file_id` received so far.
    #[must_use]
    pub fn received_ranges(&self, file_id: u8) -> Vec<Range<usize>> {
        let Some(transfer) = self.transfers.get(&file_id) else {
            return Vec::new();
        };
        let groups = transfer.received.len().div_ceil(GROUP_BITS);
        let segments: Vec<AckSegment> = (0..groups).map(|g| transfer.segment(g)).collect();
        segments_to_byte_ranges(&segments, transfer.fragment_size, transfer.data.len())
    }

    /// Stops expecting `file_id`.
    pub fn cancel(&mut self, file_id: u8) {
        self.transfers.remove(&file_id);
    }

    /// Returns `true` if `file_id` is expected.
    #[must_use]
    pub fn is_expecting(&self, file_id: u8) -> bool {
        self.transfers.contains_key(&file_id)
    }

    /// Returns `true` if nothing is expected.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Forgets every transfer.
    pub fn clear(&mut self) {
        self.transfers.clear();
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
    use crate::files::sender::{FileSender, ReceivedOutcome};
    use crate::sessions::config::FileTransferConfig;

    fn fragment(iteration: u8, position: u32, data: Vec<u8>, file_size: u32) -> FileFragmentBody {
        FileFragmentBody {
            file_id: 4,
            iteration,
            position,
            file_size,
            fragment_size: 10,
            data,
        }
    }

    #[test]
    fn unexpected_files_are_invalid() {
        let mut receiver = FileReceiver::new();
        assert_eq!(
            receiver.on_fragment(&fragment(1, 0, vec![0; 10], 20), Tic::ZERO),
            FragmentOutcome::Invalid
        );
    }

    #[test]
    fn oversized_files_are_refused_before_any_fragment() {
        let mut receiver = FileReceiver::with_max_file_size(1_000);
        assert_eq!(
            receiver.expect(4, u32::MAX, Tic::ZERO),
            Err(TransferError::TooLarge {
                name: "#4".to_owned(),
                size: u64::from(u32::MAX),
            })
        );
        assert_eq!(
            receiver.on_fragment(&fragment(1, 0, vec![0; 10], u32::MAX), Tic::ZERO),
            FragmentOutcome::Invalid
        );
        assert!(receiver.is_idle());

        receiver.expect(4, 1_000, Tic::ZERO).unwrap();
        assert!(FileReceiver::new().expect(4, DEFAULT_MAX_FILE_SIZE + 1, Tic::ZERO).is_err());
    }

    #[test]
    fn reassembles_out_of_order_fragments() {
        let mut receiver = FileReceiver::new();
        receiver.expect(4, 25, Tic::ZERO).unwrap();
        assert_eq!(
            receiver.on_fragment(&fragment(1, 20, vec![3; 5], 25), Tic::ZERO),
            FragmentOutcome::Accepted
        );
        assert_eq!(
            receiver.on_fragment(&fragment(1, 0, vec![1; 10], 25), Tic::ZERO),
            FragmentOutcome::Accepted
        );
        assert_eq!(receiver.received_ranges(4), vec![0..10, 20..25]);
        assert_eq!(
            receiver.on_fragment(&fragment(1, 0, vec![1; 10], 25), Tic::ZERO),
            FragmentOutcome::Duplicate
        );
        assert!(receiver.take_completed(4).is_none());
        assert_eq!(
            receiver.on_fragment(&fragment(1, 10, vec![2; 10], 25), Tic::ZERO),
            FragmentOutcome::Completed
        );
        let (iteration, data) = receiver.take_completed(4).unwrap();
        assert_eq!(iteration, 1);
        assert_eq!(&data[..10], &[1; 10]);
        assert_eq!(&data[20..], &[3; 5]);
        assert!(receiver.is_idle());
    }

    #[test]
    fn stale_iterations_are_ignored_and_newer_ones_restart() {
        let mut receiver = FileReceiver::new();
        receiver.expect(4, 20, Tic::ZERO).unwrap();
        receiver.on_fragment(&fragment(5, 0, vec![1; 10], 20), Tic::ZERO);
        assert_eq!(
            receiver.on_fragment(&fragment(4, 10, vec![9; 10], 20), Tic::ZERO),
            FragmentOutcome::StaleIteration
        );
        assert_eq!(
            receiver.on_fragment(&fragment(6, 10, vec![2; 10], 20), Tic::ZERO),
            FragmentOutcome::Accepted
        );
        assert_eq!(receiver.received_ranges(4), vec![10..20]);
    }

    #[test]
    fn misaligned_or_wrong_length_fragments_are_invalid() {
        let mut receiver = FileReceiver::new();
        receiver.expect(4, 20, Tic::ZERO).unwrap();
        assert_eq!(
            receiver.on_fragment(&fragment(1, 5, vec![0; 10], 20), Tic::ZERO),
            FragmentOutcome::Invalid
        );
        assert_eq!(
            receiver.on_fragment(&fragment(1, 10, vec![0; 4], 20), Tic::ZERO),
            FragmentOutcome::Invalid
        );
        assert_eq!(
            receiver.on_fragment(&fragment(1, 30, vec![0; 10], 20), Tic::ZERO),
            FragmentOutcome::Invalid
        );
        assert_eq!(
            receiver.on_fragment(&fragment(1, 0, vec![0; 10], 99), Tic::ZERO),
            FragmentOutcome::Invalid
        );
    }

    #[test]
    fn acks_cover_dirty_groups_once() {
        let mut receiver = FileReceiver::new();
        receiver.expect(4, 400, Tic::ZERO).unwrap();
        receiver.on_fragment(&fragment(1, 0, vec![0; 10], 400), Tic::ZERO);
        receiver.on_fragment(&fragment(1, 330, vec![0; 10], 400), Tic::ZERO);
        let acks = receiver.take_acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(
            acks[0].segments,
            vec![
                AckSegment { start: 0, mask: 1 },
                AckSegment { start: 32, mask: 1 << 1 },
            ]
        );
        assert!(receiver.take_acks().is_empty());
        receiver.on_fragment(&fragment(1, 0, vec![0; 10], 400), Tic::ZERO);
        assert_eq!(receiver.take_acks()[0].segments.len(), 1);
    }

    #[test]
    fn stall_detection() {
        let mut receiver = FileReceiver::new();
        receiver.expect(4, 20, Tic::ZERO).unwrap();
        receiver.on_fragment(&fragment(1, 0, vec![0; 10], 20), Tic::new(10));
        assert!(receiver.stalled(Tic::new(20), 35).is_empty());
        assert_eq!(receiver.stalled(Tic::new(45), 35), vec![4]);
    }

    #[test]
    fn byte_ranges_merge_across_segments() {
        let segments = [
            AckSegment { start: 32, mask: 1 },
            AckSegment { start: 0, mask: 1 << 31 },
        ];
        assert_eq!(segments_to_byte_ranges(&segments, 10, 1000), vec![310..330]);
        assert!(segments_to_byte_ranges(&segments, 10, 100).is_empty());
    }

    #[test]
    fn sender_and_receiver_complete_a_transfer() {
        let config = FileTransferConfig {
            fragment_size: 64,
            fragments_per_tic: 3,
            fragment_resend_tics: 4,
            transfer_timeout_tics: 100,
            ..FileTransferConfig::default()
        };
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut sender = FileSender::new(&config);
        let mut receiver = FileReceiver::new();
        receiver.expect(7, data.len() as u32, Tic::ZERO).unwrap();
        sender.start(7, data.clone(), Tic::ZERO).unwrap();

        let mut done = false;
        for tic in 0..200u32 {
            let now = Tic::new(tic);
            for (i, fragment) in sender.poll(now).into_iter().enumerate() {
                // lose a third of the early fragments
                if (tic + i as u32) % 3 == 0 && tic < 20 {
                    continue;
                }
                if receiver.on_fragment(&fragment, now) == FragmentOutcome::Completed {
                    done = true;
                }
            }
            for ack in receiver.take_acks() {
                sender.on_ack(&ack, now);
            }
            if done {
                break;
            }
        }
        assert!(done);
        let (iteration, received) = receiver.take_completed(7).unwrap();
        assert_eq!(received, data);
        assert_eq!(sender.on_received(7, iteration), ReceivedOutcome::Completed);
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod property_tests {
    use super::*;
    use crate::test_config::miri_case_count;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(miri_case_count()))]

        /// Every acknowledged byte lies inside the file and ranges never overlap.
        #[test]
        fn byte_ranges_stay_in_bounds(
            masks in proptest::collection::vec(any::<u32>(), 0..4),
            fragment_size in 1usize..200,
            file_size in 0usize..20_000,
        ) {
            let segments: Vec<AckSegment> = masks
                .iter()
                .enumerate()
                .map(|(group, mask)| AckSegment { start: (group * 32) as u32, mask: *mask })
                .collect();
            let ranges = segments_to_byte_ranges(&segments, fragment_size, file_size);
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].end < pair[1].start);
            }
            for range in &ranges {
                prop_assert!(range.start < range.end);
                prop_assert!(range.end <= file_size);
            }
        }

        /// Delivering every fragment once, in any order, completes the file.
        #[test]
        fn any_delivery_order_completes(
            size in 1u32..2_000,
            seed in any::<u64>(),
        ) {
            let fragment_size = 97usize;
            let data: Vec<u8> = (0..size).map(|i| (i as u64 ^ seed) as u8).collect();
            let count = (size as usize).div_ceil(fragment_size);
            let mut order: Vec<usize> = (0..count).collect();
            let mut state = seed;
            for i in (1..order.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                order.swap(i, (state >> 33) as usize % (i + 1));
            }
            let mut receiver = FileReceiver::new();
            receiver.expect(1, size, Tic::ZERO).unwrap();
            let mut last = FragmentOutcome::Invalid;
            for index in order {
                let start = index * fragment_size;
                let end = (start + fragment_size).min(data.len());
                last = receiver.on_fragment(&FileFragmentBody {
                    file_id: 1,
                    iteration: 3,
                    position: start as u32,
                    file_size: size,
                    fragment_size: fragment_size as u16,
                    data: data[start..end].to_vec(),
                }, Tic::ZERO);
            }
            prop_assert_eq!(last, FragmentOutcome::Completed);
            prop_assert_eq!(receiver.take_completed(1).map(|(_, d)| d), Some(data));
        }
    }
}
