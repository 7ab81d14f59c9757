//! Receive-side window state machine.
//!
//! [`ReceiverWindow`] decides, for every inbound datagram, what to deliver to
//! the output sink and which ACK (if any) to send back:
//!
//! - **Stop-and-Wait / Go-Back-N** — only the packet with `seq == expected`
//!   is accepted; its payload is delivered and `expected - 1` is ACKed
//!   cumulatively.  Anything else is discarded and the ACK for the last
//!   accepted packet is repeated, which is how a sender recovers from a lost
//!   ACK.  Nothing is buffered out of order.
//! - **Selective-Repeat** — packets in `[base, base + W)` are buffered the
//!   first time they arrive and ACKed every time.  Whenever `base` is in the
//!   buffer the contiguous run starting at `base` is delivered and `base`
//!   moves past it.  Stale packets (`seq < base`) are re-ACKed without
//!   buffering; packets at or beyond `base + W` are dropped unanswered.
//!
//! Only seqs that are buffered or already delivered are ever ACKed, and
//! nothing is ACKed before the first packet has been accepted.
//!
//! This module only manages state; the caller writes the delivered payloads
//! and sends the ACK frame.

use std::collections::BTreeMap;

use crate::config::{CorruptPolicy, Discipline, SessionConfig};
use crate::packet::{Packet, PacketCodec, PacketError};
use crate::stats::ReceiveStats;

/// How an inbound datagram was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvEvent {
    /// In-order data; at least one payload was delivered.
    Accepted,
    /// Selective-Repeat: stored until the gap before it fills.
    Buffered,
    /// Already delivered, or already buffered.
    Duplicate,
    /// Ahead of what the window accepts.
    OutOfWindow,
    Corrupt,
    Malformed,
    /// A valid packet that is not DATA.
    Ignored,
}

/// What the caller must do after one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub event: RecvEvent,
    /// Payloads to append to the output sink, in order.
    pub delivered: Vec<Vec<u8>>,
    /// Seq to acknowledge, if any.
    pub ack: Option<u32>,
}

impl Verdict {
    fn new(event: RecvEvent, ack: Option<u32>) -> Self {
        Self {
            event,
            delivered: Vec::new(),
            ack,
        }
    }
}

/// Receive-side state for one transfer.
#[derive(Debug)]
pub struct ReceiverWindow {
    discipline: Discipline,
    window_size: usize,
    codec: PacketCodec,
    corrupt_policy: CorruptPolicy,

    /// Next seq required for in-order delivery.
    expected: u32,
    /// Selective-Repeat out-of-order store.
    buffer: BTreeMap<u32, Vec<u8>>,

    stats: ReceiveStats,
}

impl ReceiverWindow {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            discipline: config.discipline,
            window_size: config.effective_window(),
            codec: PacketCodec::new(config.integrity),
            corrupt_policy: config.corrupt_policy,
            expected: 0,
            buffer: BTreeMap::new(),
            stats: ReceiveStats::default(),
        }
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    pub fn codec(&self) -> PacketCodec {
        self.codec
    }

    /// Next seq required for in-order delivery (`base` for Selective-Repeat).
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Number of out-of-order payloads held back.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> &ReceiveStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut ReceiveStats {
        &mut self.stats
    }

    /// Forget all progress, ready for an independent transfer.
    pub fn reset(&mut self) {
        self.expected = 0;
        self.buffer.clear();
        self.stats = ReceiveStats::default();
    }

    /// Seq of the last in-order packet, or `None` before the first one.
    pub fn last_in_order(&self) -> Option<u32> {
        self.expected.checked_sub(1)
    }

    /// Decode and apply one inbound datagram.
    pub fn on_datagram(&mut self, buf: &[u8]) -> Verdict {
        let decoded = self.codec.decode(buf);
        self.on_decoded(decoded)
    }

    /// Apply an already decoded (or rejected) datagram.
    pub fn on_decoded(&mut self, decoded: Result<Packet, PacketError>) -> Verdict {
        let verdict = match decoded {
            Ok(Packet::Data { seq, payload }) => match self.discipline {
                Discipline::StopAndWait | Discipline::GoBackN => self.on_in_order(seq, payload),
                Discipline::SelectiveRepeat => self.on_selective(seq, payload),
            },
            Ok(Packet::Ack { .. }) => Verdict::new(RecvEvent::Ignored, None),
            Err(e) => {
                let event = if e.is_malformed() {
                    self.stats.malformed += 1;
                    RecvEvent::Malformed
                } else {
                    self.stats.corrupt += 1;
                    RecvEvent::Corrupt
                };
                let ack = match (self.discipline, self.corrupt_policy) {
                    (Discipline::SelectiveRepeat, _) | (_, CorruptPolicy::Drop) => None,
                    (_, CorruptPolicy::ReAckLastGood) => self.last_in_order(),
                };
                Verdict::new(event, ack)
            }
        };

        for payload in &verdict.delivered {
            self.stats.delivered_bytes += payload.len() as u64;
            self.stats.delivered_packets += 1;
        }
        if verdict.ack.is_some() {
            self.stats.acks_sent += 1;
        }
        verdict
    }

    /// ACK frame for `seq`.
    pub fn ack_frame(&self, seq: u32) -> Vec<u8> {
        self.codec.encode_ack(seq)
    }

    fn on_in_order(&mut self, seq: u32, payload: Vec<u8>) -> Verdict {
        if seq == self.expected {
            self.expected += 1;
            return Verdict {
                event: RecvEvent::Accepted,
                delivered: vec![payload],
                ack: Some(seq),
            };
        }

        let event = if seq < self.expected {
            self.stats.duplicates += 1;
            RecvEvent::Duplicate
        } else {
            self.stats.out_of_window += 1;
            RecvEvent::OutOfWindow
        };
        Verdict::new(event, self.last_in_order())
    }

    fn on_selective(&mut self, seq: u32, payload: Vec<u8>) -> Verdict {
        if seq < self.expected {
            self.stats.duplicates += 1;
            return Verdict::new(RecvEvent::Duplicate, Some(seq));
        }
        if u64::from(seq) >= u64::from(self.expected).saturating_add(self.window_size as u64) {
            self.stats.out_of_window += 1;
            return Verdict::new(RecvEvent::OutOfWindow, None);
        }
        if self.buffer.contains_key(&seq) {
            self.stats.duplicates += 1;
            return Verdict::new(RecvEvent::Duplicate, Some(seq));
        }

        self.buffer.insert(seq, payload);
        let mut delivered = Vec::new();
        while let Some(payload) = self.buffer.remove(&self.expected) {
            delivered.push(payload);
            self.expected += 1;
        }

        let event = if delivered.is_empty() {
            RecvEvent::Buffered
        } else {
            RecvEvent::Accepted
        };
        Verdict {
            event,
            delivered,
            ack: Some(seq),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
