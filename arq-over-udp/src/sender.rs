//! Send-side sliding-window state machine.
//!
//! [`SenderWindow`] holds every framed DATA packet of one transfer and decides
//! what goes on the wire next.  One state shape serves all three disciplines:
//!
//! | discipline        | window | ACKs       | timer                  | on expiry                 |
//! |-------------------|--------|------------|------------------------|---------------------------|
//! | Stop-and-Wait     | 1      | exact      | one, for `base`        | resend `base`             |
//! | Go-Back-N         | `W`    | cumulative | one, for the oldest    | resend `[base, next_seq)` |
//! | Selective-Repeat  | `W`    | selective  | one per in-flight seq  | resend that seq only      |
//!
//! # Sequence-number layout
//!
//! ```text
//!  base            next_seq         base + W
//!   │                  │                │
//! ──┼──────────────────┼────────────────┼──────▶ seq
//!   │ <── in flight ──▶│ <── sendable ──▶│
//! ```
//!
//! `base` never moves backwards: ACKs below it, repeated ACKs and ACKs for
//! seqs that were never sent are counted and otherwise ignored.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.  Methods that can put packets on the wire return the seqs
//! to (re)transmit and the caller fetches each frame with [`SenderWindow::frame`].

use tokio::time::Instant;

use crate::config::{Discipline, SessionConfig};
use crate::packet::{Packet, PacketCodec, PacketError, TERMINAL_MARKER};
use crate::stats::TransferStats;
use crate::timer::{RetransmitTimer, TimerSet};

/// Split `data` into `mss`-sized payload units; the last one may be shorter.
///
/// Empty input yields no units.
pub fn split_payload(data: &[u8], mss: usize) -> Vec<Vec<u8>> {
    debug_assert!(mss > 0, "mss must be at least 1");
    data.chunks(mss.max(1)).map(<[u8]>::to_vec).collect()
}

/// `next_seq` runs up to the packet count, so the count itself must fit a
/// `u32` for [`SenderWindow::base`] and [`SenderWindow::next_seq`] to be exact.
fn check_packet_count(count: usize) -> Result<(), PacketError> {
    if u32::try_from(count).is_err() {
        return Err(PacketError::TooManyPackets(count));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SendEntry
// ---------------------------------------------------------------------------

/// One framed packet of the transfer.
#[derive(Debug, Clone)]
pub struct SendEntry {
    /// The encoded DATA packet, ready to hand to the channel.
    pub frame: Vec<u8>,
    /// Total number of times this packet has been transmitted.
    pub tx_count: u32,
    /// Time of the most recent transmission.
    pub sent_at: Option<Instant>,
    /// Selective-Repeat only: the receiver has confirmed this seq.
    pub acked: bool,
}

/// Effect of one inbound datagram on the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// `base` moved forward by this many packets.
    Advanced(usize),
    /// Selective-Repeat: a seq above `base` was marked acknowledged.
    Marked,
    /// A valid ACK that changed nothing.
    Stale,
    /// The datagram failed to decode.
    Corrupt,
    /// A valid packet that is not an ACK.
    Ignored,
}

// ---------------------------------------------------------------------------
// SenderWindow
// ---------------------------------------------------------------------------

/// Send-side state for one transfer.
///
/// The packet list is fixed at construction; a transfer holds at most
/// `u32::MAX` packets.
#[derive(Debug)]
pub struct SenderWindow {
    discipline: Discipline,
    window_size: usize,
    codec: PacketCodec,

    /// Lowest unacknowledged seq.
    base: usize,
    /// Lowest never-sent seq.
    next_seq: usize,
    window: Vec<SendEntry>,

    /// Stop-and-Wait and Go-Back-N.
    timer: RetransmitTimer,
    /// Selective-Repeat.
    timers: TimerSet,

    terminal_sent: bool,
    stats: TransferStats,
}

impl SenderWindow {
    /// Frame every payload unit up front.
    pub fn new(payloads: Vec<Vec<u8>>, config: &SessionConfig) -> Result<Self, PacketError> {
        check_packet_count(payloads.len())?;
        let codec = PacketCodec::new(config.integrity);
        let window = payloads
            .into_iter()
            .enumerate()
            .map(|(seq, payload)| {
                // In range: `check_packet_count` bounds every index by u32::MAX.
                let frame = codec.encode(&Packet::Data {
                    seq: seq as u32,
                    payload,
                })?;
                Ok(SendEntry {
                    frame,
                    tx_count: 0,
                    sent_at: None,
                    acked: false,
                })
            })
            .collect::<Result<Vec<_>, PacketError>>()?;

        let stats = TransferStats {
            packets: window.len(),
            ..TransferStats::default()
        };

        Ok(Self {
            discipline: config.discipline,
            window_size: config.effective_window(),
            codec,
            base: 0,
            next_seq: 0,
            window,
            timer: RetransmitTimer::new(config.rto),
            timers: TimerSet::new(config.rto),
            terminal_sent: false,
            stats,
        })
    }

    /// Split `data` by the configured MSS and frame the result.
    pub fn from_bytes(data: &[u8], config: &SessionConfig) -> Result<Self, PacketError> {
        Self::new(split_payload(data, config.mss), config)
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn codec(&self) -> PacketCodec {
        self.codec
    }

    pub fn base(&self) -> u32 {
        self.base as u32
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq as u32
    }

    /// Number of packets in the transfer.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Sent but not yet acknowledged packets.
    pub fn in_flight(&self) -> usize {
        self.window[self.base..self.next_seq]
            .iter()
            .filter(|e| !e.acked)
            .count()
    }

    /// `true` when the window has room and unsent packets remain.
    pub fn can_send(&self) -> bool {
        self.next_seq < self.window.len()
            && self.next_seq < self.base.saturating_add(self.window_size)
    }

    /// `true` once every packet has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.base == self.window.len()
    }

    pub fn entry(&self, seq: u32) -> Option<&SendEntry> {
        self.window.get(seq as usize)
    }

    /// Encoded frame for `seq`.
    pub fn frame(&self, seq: u32) -> Option<&[u8]> {
        self.entry(seq).map(|e| e.frame.as_slice())
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Admit new packets into the window.
    ///
    /// Returns the seqs to transmit now, in order.  Arms the retransmission
    /// timer for the first packet of a fresh window (Stop-and-Wait,
    /// Go-Back-N) or a timer per packet (Selective-Repeat).
    pub fn fill(&mut self, now: Instant) -> Vec<u32> {
        let mut sent = Vec::new();
        while self.can_send() {
            let seq = self.next_seq;
            match self.discipline {
                Discipline::SelectiveRepeat => self.timers.arm(seq as u32, now),
                Discipline::StopAndWait | Discipline::GoBackN => {
                    if self.base == self.next_seq {
                        self.timer.arm(now);
                    }
                }
            }
            self.record_transmission(seq, now);
            self.next_seq += 1;
            sent.push(seq as u32);
        }
        sent
    }

    /// Decode an inbound datagram and apply it if it is an ACK.
    pub fn on_datagram(&mut self, buf: &[u8], now: Instant) -> AckOutcome {
        match self.codec.decode(buf) {
            Ok(Packet::Ack { seq }) => self.on_ack(seq, now),
            Ok(Packet::Data { .. }) => AckOutcome::Ignored,
            Err(_) => {
                self.stats.corrupt_acks += 1;
                AckOutcome::Corrupt
            }
        }
    }

    /// Apply a decoded ACK for `seq`.
    pub fn on_ack(&mut self, seq: u32, now: Instant) -> AckOutcome {
        self.stats.acks += 1;
        let seq = seq as usize;

        // Below the window, or for a packet that was never sent.
        if seq < self.base || seq >= self.next_seq {
            self.stats.stale_acks += 1;
            return AckOutcome::Stale;
        }

        match self.discipline {
            // With W = 1 and `seq` inside [base, next_seq), `seq == base`:
            // Stop-and-Wait's exact-match rule falls out of the cumulative one.
            Discipline::StopAndWait | Discipline::GoBackN => {
                let advanced = seq + 1 - self.base;
                self.base = seq + 1;
                if self.base == self.next_seq {
                    self.timer.disarm();
                } else {
                    self.timer.arm(now);
                }
                AckOutcome::Advanced(advanced)
            }
            Discipline::SelectiveRepeat => {
                if self.window[seq].acked {
                    self.stats.stale_acks += 1;
                    return AckOutcome::Stale;
                }
                self.window[seq].acked = true;
                self.timers.disarm(seq as u32);

                let old_base = self.base;
                while self.base < self.next_seq && self.window[self.base].acked {
                    self.base += 1;
                }
                match self.base - old_base {
                    0 => AckOutcome::Marked,
                    n => AckOutcome::Advanced(n),
                }
            }
        }
    }

    /// Check timers and collect the seqs to retransmit.
    ///
    /// Expired timers are restarted from `now`.
    pub fn on_timeout(&mut self, now: Instant) -> Vec<u32> {
        let resend: Vec<usize> = match self.discipline {
            Discipline::StopAndWait | Discipline::GoBackN => {
                if !self.timer.expired(now) {
                    return Vec::new();
                }
                if self.base == self.next_seq {
                    self.timer.disarm();
                    return Vec::new();
                }
                self.timer.arm(now);
                (self.base..self.next_seq).collect()
            }
            Discipline::SelectiveRepeat => {
                let expired = self.timers.expired(now);
                for &seq in &expired {
                    self.timers.arm(seq, now);
                }
                expired.into_iter().map(|s| s as usize).collect()
            }
        };

        if !resend.is_empty() {
            self.stats.timeouts += 1;
        }
        resend
            .into_iter()
            .map(|seq| {
                self.record_transmission(seq, now);
                self.stats.retransmissions += 1;
                seq as u32
            })
            .collect()
    }

    /// Earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.discipline {
            Discipline::SelectiveRepeat => self.timers.next_deadline(),
            Discipline::StopAndWait | Discipline::GoBackN => self.timer.deadline(),
        }
    }

    /// The terminal marker, exactly once, and only after full acknowledgment.
    pub fn take_terminal_marker(&mut self) -> Option<&'static [u8]> {
        if !self.is_complete() || self.terminal_sent {
            return None;
        }
        self.terminal_sent = true;
        Some(TERMINAL_MARKER)
    }

    fn record_transmission(&mut self, seq: usize, now: Instant) {
        let entry = &mut self.window[seq];
        entry.tx_count += 1;
        entry.sent_at = Some(now);
        self.stats.transmissions += 1;
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
