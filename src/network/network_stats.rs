use crate::Tic;

/// The `NetworkStats` struct contains statistics about one remote node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// Reliable packets sent to the node that have not been acknowledged yet.
    /// A long queue means high round-trip time or heavy loss.
    pub send_queue_len: usize,
    /// Datagrams sent to the node.
    pub packets_sent: u64,
    /// Bytes sent to the node.
    pub bytes_sent: u64,
    /// Datagrams received from the node that decoded correctly.
    pub packets_received: u64,
    /// Datagrams from the node's address that were dropped by the codec.
    pub packets_rejected: u64,
    /// Reliable packets retransmitted.
    pub resends: u64,
    /// Reliable packets received more than once.
    pub duplicates: u64,
    /// Lag in tics measured from the latency stamp of the node's ticcmds,
    /// clamped to [`MAX_PREDICT_TICS`](crate::MAX_PREDICT_TICS).
    pub lag_tics: u8,
    /// First tic the node lacks, as last reported by it.
    pub nettics: Option<Tic>,
}

impl NetworkStats {
    /// Creates a new `NetworkStats` instance with default values.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            send_queue_len,
            packets_sent,
            bytes_sent,
            packets_received,
            packets_rejected,
            resends,
            duplicates,
            lag_tics,
            nettics,
        } = self;

        write!(
            f,
            "NetworkStats {{ lag: {} tics, queue: {}, sent: {} ({} bytes), received: {}, rejected: {}, resends: {}, duplicates: {}",
            lag_tics, send_queue_len, packets_sent, bytes_sent, packets_received, packets_rejected, resends, duplicates
        )?;
        if let Some(tic) = nettics {
            write!(f, ", nettics: {}", tic)?;
        }
        write!(f, " }}")
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
    fn default_is_zeroed() {
        let stats = NetworkStats::new();
        assert_eq!(stats.send_queue_len, 0);
        assert_eq!(stats.packets_rejected, 0);
        assert_eq!(stats.nettics, None);
    }

    #[test]
    fn display_mentions_nettics_only_when_known() {
        let mut stats = NetworkStats {
            lag_tics: 3,
            ..NetworkStats::default()
        };
        let text = stats.to_string();
        assert!(text.contains("lag: 3 tics"));
        assert!(!text.contains("nettics"));
        stats.nettics = Some(Tic::new(40));
        assert!(stats.to_string().contains("nettics: 40"));
    }
}
