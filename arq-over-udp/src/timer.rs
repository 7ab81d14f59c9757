//! Retransmission timers.
//!
//! Reliable delivery requires that unacknowledged packets are re-sent if no
//! ACK arrives within a bounded time.  This module provides:
//! - [`RetransmitTimer`] — a single fixed-timeout timer, as used by
//!   Stop-and-Wait and Go-Back-N.
//! - [`TimerSet`] — one independent timer per sequence number, as used by
//!   Selective-Repeat.
//!
//! The timeout is a fixed per-session value.  There is no RTT sampling and no
//! exponential back-off: expiry always re-arms with the same RTO.
//!
//! Timers never sleep and never spawn.  Every operation takes the current
//! [`Instant`] from the caller, which keeps the owning state machine
//! deterministic and lets tests drive time explicitly.  `tokio::time::Instant`
//! is used so that paused-clock tests behave.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

/// Default retransmission timeout.
pub const DEFAULT_RTO: Duration = Duration::from_millis(200);

/// A single retransmission timer with a fixed timeout.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    rto: Duration,
    deadline: Option<Instant>,
}

impl RetransmitTimer {
    pub fn new(rto: Duration) -> Self {
        Self { rto, deadline: None }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Start (or restart) the timer from `now`.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.rto);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// When the timer will fire, or `None` while disarmed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `true` once an armed timer's deadline has passed.
    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

/// Independent per-sequence-number timers sharing one fixed timeout.
#[derive(Debug, Clone)]
pub struct TimerSet {
    rto: Duration,
    deadlines: BTreeMap<u32, Instant>,
}

impl TimerSet {
    pub fn new(rto: Duration) -> Self {
        Self {
            rto,
            deadlines: BTreeMap::new(),
        }
    }

    /// Start (or restart) the timer for `seq`.
    pub fn arm(&mut self, seq: u32, now: Instant) {
        self.deadlines.insert(seq, now + self.rto);
    }

    /// Stop the timer for `seq`.  Returns `false` when it was not running.
    pub fn disarm(&mut self, seq: u32) -> bool {
        self.deadlines.remove(&seq).is_some()
    }

    pub fn is_armed(&self, seq: u32) -> bool {
        self.deadlines.contains_key(&seq)
    }

    /// Number of running timers.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Earliest deadline over all running timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Sequence numbers whose timers have fired, in ascending order.
    ///
    /// Expired timers stay armed; the caller restarts each one after
    /// retransmitting.
    pub fn expired(&self, now: Instant) -> Vec<u32> {
        self.deadlines
            .iter()
            .filter(|(_, &deadline)| now >= deadline)
            .map(|(&seq, _)| seq)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTO: Duration = Duration::from_millis(200);

    #[test]
    fn new_timer_is_disarmed() {
        let t = RetransmitTimer::new(RTO);
        assert!(!t.is_armed());
        assert!(!t.expired(Instant::now()));
        assert_eq!(t.deadline(), None);
    }

    #[test]
    fn timer_fires_after_rto() {
        let start = Instant::now();
        let mut t = RetransmitTimer::new(RTO);
        t.arm(start);

        assert!(!t.expired(start + Duration::from_millis(199)));
        assert!(t.expired(start + RTO));
        assert_eq!(t.deadline(), Some(start + RTO));
    }

    #[test]
    fn rearm_pushes_deadline_out() {
        let start = Instant::now();
        let mut t = RetransmitTimer::new(RTO);
        t.arm(start);
        t.arm(start + Duration::from_millis(150));

        assert!(!t.expired(start + RTO));
        assert!(t.expired(start + Duration::from_millis(350)));
    }

    #[test]
    fn disarmed_timer_never_fires() {
        let start = Instant::now();
        let mut t = RetransmitTimer::new(RTO);
        t.arm(start);
        t.disarm();
        assert!(!t.expired(start + RTO * 10));
    }

    #[test]
    fn timer_set_tracks_each_seq_independently() {
        let start = Instant::now();
        let mut set = TimerSet::new(RTO);
        set.arm(0, start);
        set.arm(1, start + Duration::from_millis(50));
        set.arm(2, start + Duration::from_millis(100));

        assert_eq!(set.len(), 3);
        assert_eq!(set.next_deadline(), Some(start + RTO));
        assert_eq!(set.expired(start + Duration::from_millis(260)), vec![0, 1]);

        assert!(set.disarm(1));
        assert!(!set.disarm(1));
        assert!(!set.is_armed(1));
        assert_eq!(set.expired(start + Duration::from_millis(300)), vec![0, 2]);
    }

    #[test]
    fn timer_set_restart_only_affects_one_seq() {
        let start = Instant::now();
        let mut set = TimerSet::new(RTO);
        set.arm(4, start);
        set.arm(5, start);

        set.arm(4, start + RTO);
        assert_eq!(set.expired(start + RTO), vec![5]);
    }

    #[test]
    fn empty_set_has_no_deadline() {
        let set = TimerSet::new(RTO);
        assert!(set.is_empty());
        assert_eq!(set.next_deadline(), None);
        assert!(set.expired(Instant::now()).is_empty());
    }
}
