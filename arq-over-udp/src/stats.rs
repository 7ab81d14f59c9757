//! Counters reported at the end of a transfer.

use std::fmt;
use std::time::Duration;

/// Sender-side counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Number of DATA packets in the transfer.
    pub packets: usize,
    /// DATA transmissions, first sends and retransmissions together.
    pub transmissions: u64,
    pub retransmissions: u64,
    /// Timer expiries that caused at least one retransmission.
    pub timeouts: u64,
    /// ACKs that decoded cleanly.
    pub acks: u64,
    /// Clean ACKs that moved nothing (duplicate, stale, or for an unsent seq).
    pub stale_acks: u64,
    /// Datagrams that failed to decode as an ACK.
    pub corrupt_acks: u64,
    /// Whether the receiver's completion signal arrived.
    pub completed: bool,
    pub elapsed: Duration,
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PACKETS: {}", self.packets)?;
        writeln!(f, "TRANSMISSIONS: {}", self.transmissions)?;
        writeln!(f, "RETRANSMISSIONS: {}", self.retransmissions)?;
        writeln!(f, "TIMEOUTS: {}", self.timeouts)?;
        writeln!(f, "ACKS: {}", self.acks)?;
        writeln!(f, "STALE_ACKS: {}", self.stale_acks)?;
        writeln!(f, "CORRUPT_ACKS: {}", self.corrupt_acks)?;
        writeln!(f, "COMPLETION_SIGNAL: {}", self.completed)?;
        write!(f, "TOTAL_TIME_SEC: {:.6}", self.elapsed.as_secs_f64())
    }
}

/// Receiver-side counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    pub delivered_bytes: u64,
    pub delivered_packets: u64,
    /// DATA packets for seqs already delivered or already buffered.
    pub duplicates: u64,
    /// Packets that arrived ahead of the receive window.
    pub out_of_window: u64,
    pub corrupt: u64,
    pub malformed: u64,
    pub acks_sent: u64,
    /// Total announced by the bootstrap datagram, if it arrived.
    pub announced_bytes: Option<u64>,
    /// `true` when the END marker arrived; `false` when the receiver finished
    /// by lingering after full delivery.
    pub terminal_marker_seen: bool,
    pub elapsed: Duration,
}

impl fmt::Display for ReceiveStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "WROTE_BYTES: {}", self.delivered_bytes)?;
        writeln!(f, "PACKETS: {}", self.delivered_packets)?;
        writeln!(f, "DUPLICATES: {}", self.duplicates)?;
        writeln!(f, "OUT_OF_WINDOW: {}", self.out_of_window)?;
        writeln!(f, "CORRUPT: {}", self.corrupt)?;
        writeln!(f, "MALFORMED: {}", self.malformed)?;
        writeln!(f, "ACKS_SENT: {}", self.acks_sent)?;
        write!(f, "TOTAL_TIME_SEC: {:.6}", self.elapsed.as_secs_f64())
    }
}
