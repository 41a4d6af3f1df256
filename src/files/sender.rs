//! Outgoing file transfers to one node.

use std::collections::BTreeMap;

use crate::files::receiver::acked_fragments;
use crate::files::TransferError;
use crate::network::messages::{FileAckBody, FileFragmentBody};
use crate::sessions::config::FileTransferConfig;
use crate::Tic;

/// What a `FILERECEIVED` meant for the transfer it names.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReceivedOutcome {
    /// Every fragment was acknowledged; the transfer finished.
    Completed,
    /// The receiver gave up on or already had the file; the transfer was dropped.
    Aborted,
    /// No transfer with that id and iteration exists.
    Ignored,
}

#[derive(Debug)]
struct OutgoingTransfer {
    iteration: u8,
    data: Vec<u8>,
    acked: Vec<bool>,
    last_sent: Vec<Option<Tic>>,
    last_progress: Tic,
}

impl OutgoingTransfer {
    fn unacked(&self) -> usize {
        self.acked.iter().filter(|acked| !**acked).count()
    }
}

/// Paces fragments of every file being sent to one node and tracks their acks.
///
/// Each `start` of a file id bumps its iteration, so fragments and acks of an
/// abandoned attempt can never be mistaken for the current one.
#[derive(Debug)]
pub struct FileSender {
    fragment_size: usize,
    fragments_per_tic: usize,
    fragment_resend_tics: u32,
    transfer_timeout_tics: u32,
    transfers: BTreeMap<u8, OutgoingTransfer>,
    iterations: BTreeMap<u8, u8>,
}

impl FileSender {
    /// Creates an idle sender.
    #[must_use]
    pub fn new(config: &FileTransferConfig) -> Self {
        Self {
            fragment_size: usize::from(config.fragment_size).max(1),
            fragments_per_tic: config.fragments_per_tic.max(1),
            fragment_resend_tics: config.fragment_resend_tics,
            transfer_timeout_tics: config.transfer_timeout_tics,
            transfers: BTreeMap::new(),
            iterations: BTreeMap::new(),
        }
    }

    /// Starts (or restarts) sending `data` as `file_id`. Returns the iteration
    /// of the new attempt.
    pub fn start(&mut self, file_id: u8, data: Vec<u8>, now: Tic) -> Result<u8, TransferError> {
        if u32::try_from(data.len()).is_err() {
            return Err(TransferError::TooLarge {
                name: format!("file {}", file_id),
                size: data.len() as u64,
            });
        }
        let iteration = self
            .iterations
            .entry(file_id)
            .and_modify(|it| *it = it.wrapping_add(1))
            .or_insert(1);
        let iteration = *iteration;
        let fragments = data.len().div_ceil(self.fragment_size).max(1);
        tracing::debug!(file_id, iteration, bytes = data.len(), fragments, "file transfer started");
        self.transfers.insert(
            file_id,
            OutgoingTransfer {
                iteration,
                data,
                acked: vec![false; fragments],
                last_sent: vec![None; fragments],
                last_progress: now,
            },
        );
        Ok(iteration)
    }

    /// Applies a receiver's acknowledgments.
    pub fn on_ack(&mut self, ack: &FileAckBody, now: Tic) {
        let Some(transfer) = self.transfers.get_mut(&ack.file_id) else {
            return;
        };
        if transfer.iteration != ack.iteration {
            tracing::trace!(
                file_id = ack.file_id,
                iteration = ack.iteration,
                current = transfer.iteration,
                "ack for another iteration ignored"
            );
            return;
        }
        let mut progressed = false;
        for index in acked_fragments(&ack.segments) {
            if let Some(acked) = transfer.acked.get_mut(index) {
                if !*acked {
                    *acked = true;
                    progressed = true;
                }
            }
        }
        if progressed {
            transfer.last_progress = now;
        }
    }

    /// Handles `FILERECEIVED`. The transfer is removed unless the message is ignored.
    pub fn on_received(&mut self, file_id: u8, iteration: u8) -> ReceivedOutcome {
        let outcome = match self.transfers.get(&file_id) {
            Some(transfer) if transfer.iteration == iteration => {
                if transfer.unacked() == 0 {
                    ReceivedOutcome::Completed
                } else {
                    ReceivedOutcome::Aborted
                }
            },
            _ => ReceivedOutcome::Ignored,
        };
        if outcome != ReceivedOutcome::Ignored {
            self.transfers.remove(&file_id);
            tracing::debug!(file_id, iteration, ?outcome, "file transfer closed");
        }
        outcome
    }

    /// Fragments to send this tic, at most `fragments_per_tic` of them.
    ///
    /// Fragments never sent go first, then unacknowledged fragments whose
    /// last send is at least `fragment_resend_tics` old.
    pub fn poll(&mut self, now: Tic) -> Vec<FileFragmentBody> {
        let mut out = Vec::new();
        for resend_pass in [false, true] {
            for (&file_id, transfer) in &mut self.transfers {
                let file_size = transfer.data.len();
                for index in 0..transfer.acked.len() {
                    if out.len() >= self.fragments_per_tic {
                        return out;
                    }
                    if transfer.acked[index] {
                        continue;
                    }
                    let due = match transfer.last_sent[index] {
                        None => !resend_pass,
                        Some(sent) => {
                            resend_pass && now - sent >= i64::from(self.fragment_resend_tics)
                        },
                    };
                    if !due {
                        continue;
                    }
                    let start = index * self.fragment_size;
                    let end = (start + self.fragment_size).min(file_size);
                    transfer.last_sent[index] = Some(now);
                    out.push(FileFragmentBody {
                        file_id,
                        iteration: transfer.iteration,
                        position: start as u32,
                        file_size: file_size as u32,
                        fragment_size: self.fragment_size as u16,
                        data: transfer.data.get(start..end).map(<[u8]>::to_vec).unwrap_or_default(),
                    });
                }
            }
        }
        out
    }

    /// File ids that made no progress for `transfer_timeout_tics`.
    #[must_use]
    pub fn stalled(&self, now: Tic) -> Vec<u8> {
        self.transfers
            .iter()
            .filter(|(_, t)| now - t.last_progress >= i64::from(self.transfer_timeout_tics))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drops a transfer without notifying the receiver.
    pub fn cancel(&mut self, file_id: u8) {
        self.transfers.remove(&file_id);
    }

    /// Returns `true` if `file_id` is being sent.
    #[must_use]
    pub fn is_active(&self, file_id: u8) -> bool {
        self.transfers.contains_key(&file_id)
    }

    /// Current iteration of an active transfer.
    #[must_use]
    pub fn iteration(&self, file_id: u8) -> Option<u8> {
        self.transfers.get(&file_id).map(|t| t.iteration)
    }

    /// The iteration the next `start` of `file_id` will use.
    #[must_use]
    pub fn next_iteration(&self, file_id: u8) -> u8 {
        self.iterations.get(&file_id).map_or(1, |it| it.wrapping_add(1))
    }

    /// Acknowledged and total fragments of an active transfer.
    #[must_use]
    pub fn progress(&self, file_id: u8) -> Option<(usize, usize)> {
        self.transfers
            .get(&file_id)
            .map(|t| (t.acked.len() - t.unacked(), t.acked.len()))
    }

    /// Returns `true` if nothing is being sent.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.transfers.is_empty()
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
    use crate::network::messages::AckSegment;

    fn config() -> FileTransferConfig {
        FileTransferConfig {
            fragment_size: 100,
            fragments_per_tic: 4,
            fragment_resend_tics: 10,
            transfer_timeout_tics: 50,
            ..FileTransferConfig::default()
        }
    }

    fn ack_all(sender: &mut FileSender, file_id: u8, iteration: u8, fragments: u32, now: Tic) {
        let mask = if fragments >= 32 { u32::MAX } else { (1 << fragments) - 1 };
        sender.on_ack(
            &FileAckBody {
                file_id,
                iteration,
                segments: vec![AckSegment { start: 0, mask }],
            },
            now,
        );
    }

    #[test]
    fn paces_fragments_per_tic() {
        let mut sender = FileSender::new(&config());
        sender.start(1, vec![7; 950], Tic::ZERO).unwrap();
        let first = sender.poll(Tic::ZERO);
        assert_eq!(first.len(), 4);
        assert_eq!(first[0].position, 0);
        assert_eq!(first[3].position, 300);
        let second = sender.poll(Tic::new(1));
        assert_eq!(second[0].position, 400);
        let third = sender.poll(Tic::new(2));
        assert_eq!(third.len(), 2);
        assert_eq!(third[1].data.len(), 50);
        assert!(sender.poll(Tic::new(3)).is_empty());
    }

    #[test]
    fn unacked_fragments_are_resent_after_interval() {
        let mut sender = FileSender::new(&config());
        sender.start(1, vec![1; 200], Tic::ZERO).unwrap();
        assert_eq!(sender.poll(Tic::ZERO).len(), 2);
        sender.on_ack(
            &FileAckBody {
                file_id: 1,
                iteration: 1,
                segments: vec![AckSegment { start: 0, mask: 0b01 }],
            },
            Tic::new(2),
        );
        assert!(sender.poll(Tic::new(5)).is_empty());
        let resent = sender.poll(Tic::new(10));
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].position, 100);
    }

    #[test]
    fn received_completes_only_when_everything_is_acked() {
        let mut sender = FileSender::new(&config());
        let iteration = sender.start(9, vec![0; 300], Tic::ZERO).unwrap();
        assert_eq!(sender.on_received(9, iteration.wrapping_add(1)), ReceivedOutcome::Ignored);
        ack_all(&mut sender, 9, iteration, 3, Tic::new(1));
        assert_eq!(sender.on_received(9, iteration), ReceivedOutcome::Completed);
        assert!(sender.is_idle());

        let iteration = sender.start(9, vec![0; 300], Tic::new(2)).unwrap();
        assert_eq!(sender.on_received(9, iteration), ReceivedOutcome::Aborted);
        assert!(!sender.is_active(9));
    }

    #[test]
    fn restart_bumps_iteration_and_ignores_old_acks() {
        let mut sender = FileSender::new(&config());
        assert_eq!(sender.next_iteration(255), 1);
        let first = sender.start(255, vec![0; 100], Tic::ZERO).unwrap();
        assert_eq!(sender.next_iteration(255), first.wrapping_add(1));
        let second = sender.start(255, vec![0; 100], Tic::ZERO).unwrap();
        assert_ne!(first, second);
        ack_all(&mut sender, 255, first, 1, Tic::new(1));
        assert_eq!(sender.progress(255), Some((0, 1)));
    }

    #[test]
    fn empty_files_still_send_one_fragment() {
        let mut sender = FileSender::new(&config());
        sender.start(3, Vec::new(), Tic::ZERO).unwrap();
        let fragments = sender.poll(Tic::ZERO);
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].data.is_empty());
        assert_eq!(fragments[0].file_size, 0);
    }

    #[test]
    fn stall_detection_uses_last_progress() {
        let mut sender = FileSender::new(&config());
        let iteration = sender.start(2, vec![0; 250], Tic::ZERO).unwrap();
        sender.on_ack(
            &FileAckBody {
                file_id: 2,
                iteration,
                segments: vec![AckSegment { start: 0, mask: 1 }],
            },
            Tic::new(30),
        );
        assert!(sender.stalled(Tic::new(60)).is_empty());
        assert_eq!(sender.stalled(Tic::new(80)), vec![2]);
    }
}
