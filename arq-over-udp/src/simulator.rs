//! Network fault injection.
//!
//! Real networks drop, reorder, duplicate and corrupt datagrams.  To exercise
//! the retransmission machinery without depending on actual network
//! conditions, [`LossyChannel`] wraps any [`Channel`] and applies a seeded
//! fault model to every outgoing datagram:
//!
//! | Fault       | Description                                             |
//! |-------------|---------------------------------------------------------|
//! | Loss        | Drop the datagram with probability `loss_rate`.         |
//! | Corruption  | Flip one random bit with probability `corrupt_rate`.    |
//! | Reordering  | Hold the datagram back until after the next send.       |
//! | Duplication | Send the datagram twice.                                |
//!
//! A held datagram is also released by [`Channel::flush`], which the
//! sessions call after their final END or DONE, so the last datagram of a
//! transfer is never held forever.
//!
//! Faults are applied on the send path only; receives pass straight through
//! to the inner channel.  With `spare_control` set, the out-of-band control
//! datagrams (END, DONE, the size announcement) bypass the fault model so
//! only ARQ traffic is disturbed.  The same seed always produces the same fault
//! sequence for the same sequence of sends.

use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::channel::{Channel, ChannelError, Datagram};
use crate::packet::Control;

/// Configuration for the fault model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultConfig {
    pub loss_rate: f64,
    pub corrupt_rate: f64,
    pub reorder_rate: f64,
    pub duplicate_rate: f64,
    pub seed: u64,
    /// Pass control datagrams through untouched.
    pub spare_control: bool,
}

impl Default for FaultConfig {
    fn default() -> Self {
        // No faults: a transparent pass-through.
        Self {
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            reorder_rate: 0.0,
            duplicate_rate: 0.0,
            seed: 0,
            spare_control: false,
        }
    }
}

impl FaultConfig {
    /// Only loss, at `rate`.
    pub fn lossy(rate: f64, seed: u64) -> Self {
        Self {
            loss_rate: rate,
            seed,
            ..Self::default()
        }
    }
}

/// How many datagrams each fault touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounters {
    pub sent: u64,
    pub dropped: u64,
    pub corrupted: u64,
    pub reordered: u64,
    pub duplicated: u64,
}

type Held = (Vec<u8>, SocketAddr);

/// What to do with one outgoing datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    Drop,
    Hold,
    Deliver { copies: usize },
}

struct FaultState {
    rng: StdRng,
    /// A datagram held back for reordering, released after the next send
    /// or on flush.
    held: Option<Held>,
    counters: FaultCounters,
}

/// A fault-injecting wrapper around another [`Channel`].
pub struct LossyChannel<C> {
    inner: C,
    config: FaultConfig,
    state: Mutex<FaultState>,
}

impl<C: Channel> LossyChannel<C> {
    pub fn new(inner: C, config: FaultConfig) -> Self {
        let state = FaultState {
            rng: StdRng::seed_from_u64(config.seed),
            held: None,
            counters: FaultCounters::default(),
        };
        Self {
            inner,
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn counters(&self) -> FaultCounters {
        self.lock().counters
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Roll the dice for one datagram.  Corruption is applied to `bytes` in
    /// place; the guard is released before the caller awaits anything.
    fn decide(&self, bytes: &mut Vec<u8>, dest: SocketAddr) -> (Fate, Option<Held>) {
        let mut st = self.lock();
        st.counters.sent += 1;

        if st.rng.gen_bool(clamp(self.config.loss_rate)) {
            st.counters.dropped += 1;
            return (Fate::Drop, None);
        }

        if !bytes.is_empty() && st.rng.gen_bool(clamp(self.config.corrupt_rate)) {
            let bit = st.rng.gen_range(0..bytes.len() * 8);
            bytes[bit / 8] ^= 1 << (bit % 8);
            st.counters.corrupted += 1;
        }

        // A datagram already held is released after this one, so this one
        // overtakes it.
        let released = st.held.take();

        if released.is_none() && st.rng.gen_bool(clamp(self.config.reorder_rate)) {
            st.held = Some((std::mem::take(bytes), dest));
            st.counters.reordered += 1;
            return (Fate::Hold, None);
        }

        let copies = if st.rng.gen_bool(clamp(self.config.duplicate_rate)) {
            st.counters.duplicated += 1;
            2
        } else {
            1
        };
        (Fate::Deliver { copies }, released)
    }
}

fn clamp(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

#[async_trait]
impl<C: Channel> Channel for LossyChannel<C> {
    async fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), ChannelError> {
        if self.config.spare_control && Control::parse(bytes).is_some() {
            return self.inner.send(bytes, dest).await;
        }

        let mut out = bytes.to_vec();
        let (fate, released) = self.decide(&mut out, dest);

        match fate {
            Fate::Drop => {
                log::trace!("[sim] drop {} bytes to {dest}", bytes.len());
            }
            Fate::Hold => {
                log::trace!("[sim] hold {} bytes to {dest}", bytes.len());
            }
            Fate::Deliver { copies } => {
                for _ in 0..copies {
                    self.inner.send(&out, dest).await?;
                }
            }
        }

        if let Some((late, late_dest)) = released {
            log::trace!("[sim] release held {} bytes to {late_dest}", late.len());
            self.inner.send(&late, late_dest).await?;
        }
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Datagram>, ChannelError> {
        self.inner.recv(timeout).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    /// Send any datagram still held for reordering.
    async fn flush(&self) -> Result<(), ChannelError> {
        let held = self.lock().held.take();
        if let Some((bytes, dest)) = held {
            log::trace!("[sim] flush held {} bytes to {dest}", bytes.len());
            self.inner.send(&bytes, dest).await?;
        }
        self.inner.flush().await
    }
}
