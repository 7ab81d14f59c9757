//! Session configuration.
//!
//! Everything the core consumes but never computes: window size, MSS, the
//! fixed RTO, the selected discipline and integrity scheme, and the policy
//! knobs for ambiguous receiver behaviour.  The binary fills this in from
//! command-line flags; tests build it directly.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::packet::{DATA_HEADER_LEN, MAX_PAYLOAD};
use crate::timer::DEFAULT_RTO;

pub use crate::integrity::IntegrityKind;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Retransmission discipline shared by both ends of a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Discipline {
    /// One packet outstanding; each must be ACKed before the next is sent.
    StopAndWait,
    /// Up to `W` outstanding; cumulative ACKs; timeout resends the whole window.
    #[default]
    GoBackN,
    /// Up to `W` outstanding; per-packet ACKs and timers; receiver buffers.
    SelectiveRepeat,
}

impl Discipline {
    /// Short tag used as a log prefix.
    pub fn tag(self) -> &'static str {
        match self {
            Discipline::StopAndWait => "sw",
            Discipline::GoBackN => "gbn",
            Discipline::SelectiveRepeat => "sr",
        }
    }

    /// `true` when ACKs acknowledge everything up to and including their seq.
    pub fn is_cumulative(self) -> bool {
        !matches!(self, Discipline::SelectiveRepeat)
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Discipline::StopAndWait => "stop-and-wait",
            Discipline::GoBackN => "go-back-n",
            Discipline::SelectiveRepeat => "selective-repeat",
        };
        f.write_str(name)
    }
}

/// What a Stop-and-Wait / Go-Back-N receiver does with a corrupt or
/// malformed packet.  Selective-Repeat always drops them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CorruptPolicy {
    /// Re-send the ACK for the last in-order packet, if there is one.
    #[default]
    ReAckLastGood,
    /// Discard without answering.
    Drop,
}

/// Invalid configuration, reported before any protocol state exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("window size must be at least 1")]
    ZeroWindow,
    #[error("window size {0} exceeds the 32-bit sequence space")]
    WindowTooLarge(usize),
    #[error("maximum segment size must be at least 1 byte")]
    ZeroMss,
    #[error("maximum segment size {0} does not fit in one datagram")]
    MssTooLarge(usize),
    #[error("retransmission timeout must be non-zero")]
    ZeroRto,
    #[error("receive poll interval must be non-zero")]
    ZeroPollInterval,
}

/// Parameters for one transfer.  Both ends must agree on `discipline`,
/// `window` and `integrity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub discipline: Discipline,
    /// Window size `W` in packets.  Forced to 1 for Stop-and-Wait.
    pub window: usize,
    /// Payload bytes per DATA packet.
    pub mss: usize,
    /// Fixed retransmission timeout.
    pub rto: Duration,
    pub integrity: IntegrityKind,
    pub corrupt_policy: CorruptPolicy,
    /// Upper bound on a single blocking receive.
    pub poll_interval: Duration,
    /// How long the sender waits for the completion signal, and how long a
    /// receiver that has everything waits for a missing END marker.
    pub linger: Duration,
    /// Receiver gives up after this long without any datagram.
    pub idle_timeout: Duration,
    /// Send the decimal total byte count before the first DATA packet.
    pub announce_size: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discipline: Discipline::default(),
            window: 10,
            mss: 1000,
            rto: DEFAULT_RTO,
            integrity: IntegrityKind::default(),
            corrupt_policy: CorruptPolicy::default(),
            poll_interval: Duration::from_millis(50),
            linger: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
            announce_size: true,
        }
    }
}

impl SessionConfig {
    /// Default configuration for `discipline`.
    pub fn for_discipline(discipline: Discipline) -> Self {
        Self {
            discipline,
            ..Self::default()
        }
    }

    /// The window actually used: always 1 for Stop-and-Wait.
    pub fn effective_window(&self) -> usize {
        match self.discipline {
            Discipline::StopAndWait => 1,
            _ => self.window,
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if u32::try_from(self.window).is_err() {
            return Err(ConfigError::WindowTooLarge(self.window));
        }
        if self.mss == 0 {
            return Err(ConfigError::ZeroMss);
        }
        if self.mss > MAX_PAYLOAD || self.mss + DATA_HEADER_LEN > MAX_DATAGRAM {
            return Err(ConfigError::MssTooLarge(self.mss));
        }
        if self.rto.is_zero() {
            return Err(ConfigError::ZeroRto);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }
}
