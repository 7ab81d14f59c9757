//! Transfer drivers: the I/O loops around [`SenderWindow`] and [`ReceiverWindow`].
//!
//! # Architecture
//!
//! ```text
//!   SenderSession                                   ReceiverSession
//!     ├── SenderWindow  (admission, timers)           ├── ReceiverWindow (delivery, ACK choice)
//!     └── Channel ──── bootstrap · DATA · END ───────▶└── Channel ──▶ sink (AsyncWrite)
//!                 ◀──────────── ACK · DONE ──────────────┘
//! ```
//!
//! # Two sender modes
//!
//! **Cooperative** ([`SenderSession::transfer`]): one loop fills the window,
//! blocks on the channel for at most the time left before the next timer
//! deadline (capped at the poll interval), applies whatever arrived, then
//! fires expired timers.  The receive is the only suspension point.
//!
//! **Concurrent** ([`SenderSession::transfer_concurrent`]): a sending task, an
//! ACK-receiving task and a timer task share one
//! `Arc<tokio::sync::Mutex<SenderWindow>>`.  Every window mutation happens
//! under that lock, so a timer can never fire against a `base` that an ACK
//! has already moved.  A `watch` channel carries the single stop signal,
//! which every task raises as it exits, even while unwinding from a panic.
//!
//! Both modes end the same way: END once, then up to `linger` waiting for
//! the receiver's DONE.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::{Channel, ChannelError};
use crate::config::{ConfigError, SessionConfig};
use crate::packet::{Control, PacketError};
use crate::receiver::{RecvEvent, ReceiverWindow};
use crate::sender::{split_payload, AckOutcome, SenderWindow};
use crate::stats::{ReceiveStats, TransferStats};

/// Failures that end a session.  Lost, corrupt and duplicated packets are
/// never errors; they are handled inside the windows.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot frame payload: {0}")]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("output error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no datagram from the peer for {0:?}")]
    PeerSilent(Duration),
    #[error("transfer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Time to block in one receive: until the next timer deadline, never
/// longer than `poll`.
fn wait_budget(deadline: Option<Instant>, now: Instant, poll: Duration) -> Duration {
    deadline
        .map(|d| d.saturating_duration_since(now))
        .unwrap_or(poll)
        .min(poll)
}

// ---------------------------------------------------------------------------
// SenderSession
// ---------------------------------------------------------------------------

/// Sends one byte buffer reliably to a fixed peer.
pub struct SenderSession<C> {
    channel: Arc<C>,
    peer: SocketAddr,
    config: SessionConfig,
}

impl<C: Channel + 'static> SenderSession<C> {
    /// Validate `config` and take ownership of `channel`.
    pub fn new(channel: C, peer: SocketAddr, config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            channel: Arc::new(channel),
            peer,
            config,
        })
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Transfer `data` with the single cooperative loop.
    pub async fn transfer(&self, data: &[u8]) -> Result<TransferStats, SessionError> {
        let started = Instant::now();
        let mut window = self.open(data).await?;
        let tag = window.discipline().tag();
        let mut early_done = false;

        while !window.is_complete() {
            let now = Instant::now();
            let seqs = window.fill(now);
            self.transmit(&window, &seqs, false).await?;

            let wait = wait_budget(window.next_deadline(), now, self.config.poll_interval);
            if let Some(dg) = self.channel.recv(wait).await? {
                if dg.from != self.peer {
                    log::debug!("[{tag}] ignoring datagram from {}", dg.from);
                } else if self.on_reply(&mut window, &dg.bytes, Instant::now()) {
                    early_done = true;
                    break;
                }
            }

            let seqs = window.on_timeout(Instant::now());
            self.transmit(&window, &seqs, true).await?;
        }

        self.close(&mut window, early_done, started).await
    }

    /// Transfer `data` with three concurrent tasks over one locked window.
    pub async fn transfer_concurrent(&self, data: &[u8]) -> Result<TransferStats, SessionError> {
        let started = Instant::now();
        let window = Arc::new(Mutex::new(self.open(data).await?));
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let room = Arc::new(Notify::new());

        let ctx = TaskContext {
            channel: Arc::clone(&self.channel),
            peer: self.peer,
            poll: self.config.poll_interval,
            window: Arc::clone(&window),
            stop_tx: Arc::clone(&stop_tx),
            room: Arc::clone(&room),
        };

        // An empty transfer is complete before any task starts.
        if window.lock().await.is_complete() {
            stop_tx.send_replace(true);
        }

        let handles: [JoinHandle<Result<bool, SessionError>>; 3] = [
            tokio::spawn(ctx.clone().guarded(stop_rx.clone(), send_task)),
            tokio::spawn(ctx.clone().guarded(stop_rx.clone(), ack_task)),
            tokio::spawn(ctx.guarded(stop_rx, timer_task)),
        ];

        // Every task raises the stop signal on exit, so each await below ends
        // once any one of them has finished, failed or panicked.
        let mut early_done = false;
        let mut failure = None;
        for handle in handles {
            match handle.await.map_err(SessionError::from).and_then(|r| r) {
                Ok(done) => early_done |= done,
                Err(e) => failure = failure.or(Some(e)),
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let mut window = window.lock().await;
        self.close(&mut window, early_done, started).await
    }

    /// Frame `data` and announce its size.
    async fn open(&self, data: &[u8]) -> Result<SenderWindow, SessionError> {
        let window = SenderWindow::new(split_payload(data, self.config.mss), &self.config)?;
        let tag = window.discipline().tag();
        log::info!(
            "[{tag}] sending {} bytes as {} packet(s) to {} (W={}, MSS={}, RTO={:?}, {})",
            data.len(),
            window.len(),
            self.peer,
            window.window_size(),
            self.config.mss,
            self.config.rto,
            self.config.integrity,
        );
        if self.config.announce_size {
            let announce = Control::Bootstrap(data.len() as u64).to_bytes();
            self.channel.send(&announce, self.peer).await?;
            log::debug!("[{tag}] → SIZE {}", data.len());
        }
        Ok(window)
    }

    async fn transmit(
        &self,
        window: &SenderWindow,
        seqs: &[u32],
        retransmit: bool,
    ) -> Result<(), SessionError> {
        let tag = window.discipline().tag();
        if retransmit && !seqs.is_empty() {
            log::debug!("[{tag}] timeout — retransmitting {} packet(s)", seqs.len());
        }
        for &seq in seqs {
            if let Some(frame) = window.frame(seq) {
                self.channel.send(frame, self.peer).await?;
                log::debug!("[{tag}] → DATA seq={seq} in_flight={}", window.in_flight());
            }
        }
        Ok(())
    }

    /// Apply one datagram from the peer.  Returns `true` when the receiver
    /// has already signalled completion.
    fn on_reply(&self, window: &mut SenderWindow, bytes: &[u8], now: Instant) -> bool {
        let tag = window.discipline().tag();
        match Control::parse(bytes) {
            Some(Control::Complete) => {
                log::warn!("[{tag}] receiver finished before every ACK arrived");
                return true;
            }
            Some(other) => {
                log::debug!("[{tag}] ignoring control datagram {other:?}");
                return false;
            }
            None => {}
        }
        log_ack_outcome(tag, window.on_datagram(bytes, now), window.base());
        false
    }

    /// Send END, wait for DONE and collect the statistics.
    async fn close(
        &self,
        window: &mut SenderWindow,
        mut completed: bool,
        started: Instant,
    ) -> Result<TransferStats, SessionError> {
        let tag = window.discipline().tag();
        if let Some(marker) = window.take_terminal_marker() {
            self.channel.send(marker, self.peer).await?;
            log::debug!("[{tag}] → END");
        }
        self.channel.flush().await?;

        if !completed {
            completed = self.await_completion().await?;
        }
        if !completed {
            log::warn!("[{tag}] no completion signal within {:?}", self.config.linger);
        }

        let mut stats = window.stats().clone();
        stats.completed = completed;
        stats.elapsed = started.elapsed();
        log::info!(
            "[{tag}] done: {} packet(s), {} retransmission(s) in {:?}",
            stats.packets,
            stats.retransmissions,
            stats.elapsed
        );
        Ok(stats)
    }

    async fn await_completion(&self) -> Result<bool, SessionError> {
        let deadline = Instant::now() + self.config.linger;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            match self.channel.recv(deadline - now).await? {
                Some(dg)
                    if dg.from == self.peer
                        && Control::parse(&dg.bytes) == Some(Control::Complete) =>
                {
                    return Ok(true);
                }
                // Late ACKs and anything else.
                Some(_) => {}
                None => return Ok(false),
            }
        }
    }
}

fn log_ack_outcome(tag: &str, outcome: AckOutcome, base: u32) {
    match outcome {
        AckOutcome::Advanced(n) => log::debug!("[{tag}] ← ACK slid={n} base={base}"),
        AckOutcome::Marked => log::debug!("[{tag}] ← ACK marked, base={base}"),
        AckOutcome::Stale => log::debug!("[{tag}] ← stale ACK ignored"),
        AckOutcome::Corrupt => log::debug!("[{tag}] ← corrupt ACK dropped"),
        AckOutcome::Ignored => log::debug!("[{tag}] ← non-ACK packet ignored"),
    }
}

// ---------------------------------------------------------------------------
// Concurrent sender tasks
// ---------------------------------------------------------------------------

/// Everything the three sender tasks share.
struct TaskContext<C> {
    channel: Arc<C>,
    peer: SocketAddr,
    poll: Duration,
    window: Arc<Mutex<SenderWindow>>,
    stop_tx: Arc<watch::Sender<bool>>,
    /// Wakes the sending task when an ACK may have opened the window.
    room: Arc<Notify>,
}

impl<C> Clone for TaskContext<C> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            peer: self.peer,
            poll: self.poll,
            window: Arc::clone(&self.window),
            stop_tx: Arc::clone(&self.stop_tx),
            room: Arc::clone(&self.room),
        }
    }
}

impl<C: Channel + 'static> TaskContext<C> {
    /// Run `task`, raising the stop signal when it exits for any reason so
    /// its siblings exit too.
    async fn guarded<F, Fut>(
        self,
        stop: watch::Receiver<bool>,
        task: F,
    ) -> Result<bool, SessionError>
    where
        F: FnOnce(TaskContext<C>, watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = Result<bool, SessionError>>,
    {
        let _stop = StopOnDrop(Arc::clone(&self.stop_tx));
        task(self, stop).await
    }

    async fn send_frames(
        &self,
        tag: &str,
        frames: Vec<(u32, Vec<u8>)>,
    ) -> Result<(), SessionError> {
        for (seq, frame) in frames {
            self.channel.send(&frame, self.peer).await?;
            log::debug!("[{tag}:tx] → DATA seq={seq}");
        }
        Ok(())
    }
}

/// Raises the stop signal when dropped, including while a panicking task
/// unwinds.
struct StopOnDrop(Arc<watch::Sender<bool>>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// Copy out the frames for `seqs` so they can be sent after the lock is released.
fn collect_frames(window: &SenderWindow, seqs: &[u32]) -> Vec<(u32, Vec<u8>)> {
    seqs.iter()
        .filter_map(|&seq| window.frame(seq).map(|f| (seq, f.to_vec())))
        .collect()
}

/// Admit packets whenever the window has room.
async fn send_task<C: Channel + 'static>(
    ctx: TaskContext<C>,
    mut stop: watch::Receiver<bool>,
) -> Result<bool, SessionError> {
    while !*stop.borrow() {
        let (tag, frames) = {
            let mut window = ctx.window.lock().await;
            let seqs = window.fill(Instant::now());
            (window.discipline().tag(), collect_frames(&window, &seqs))
        };
        ctx.send_frames(tag, frames).await?;

        tokio::select! {
            _ = stop.changed() => {}
            _ = ctx.room.notified() => {}
        }
    }
    Ok(false)
}

/// Apply ACKs; raise the stop signal once everything is acknowledged.
async fn ack_task<C: Channel + 'static>(
    ctx: TaskContext<C>,
    stop: watch::Receiver<bool>,
) -> Result<bool, SessionError> {
    while !*stop.borrow() {
        let Some(dg) = ctx.channel.recv(ctx.poll).await? else {
            continue;
        };
        if dg.from != ctx.peer {
            continue;
        }

        let mut window = ctx.window.lock().await;
        let tag = window.discipline().tag();
        match Control::parse(&dg.bytes) {
            Some(Control::Complete) => {
                log::warn!("[{tag}:rx] receiver finished before every ACK arrived");
                ctx.stop_tx.send_replace(true);
                return Ok(true);
            }
            Some(_) => continue,
            None => {}
        }

        let outcome = window.on_datagram(&dg.bytes, Instant::now());
        log_ack_outcome(tag, outcome, window.base());
        if window.is_complete() {
            ctx.stop_tx.send_replace(true);
        } else if matches!(outcome, AckOutcome::Advanced(_)) {
            ctx.room.notify_one();
        }
    }
    Ok(false)
}

/// Sleep until the earliest deadline and retransmit whatever expired.
async fn timer_task<C: Channel + 'static>(
    ctx: TaskContext<C>,
    mut stop: watch::Receiver<bool>,
) -> Result<bool, SessionError> {
    while !*stop.borrow() {
        let deadline = ctx.window.lock().await.next_deadline();
        let now = Instant::now();
        let nap = wait_budget(deadline, now, ctx.poll);

        tokio::select! {
            _ = stop.changed() => {}
            _ = tokio::time::sleep(nap) => {}
        }
        if *stop.borrow() {
            break;
        }

        let (tag, frames) = {
            let mut window = ctx.window.lock().await;
            let seqs = window.on_timeout(Instant::now());
            (window.discipline().tag(), collect_frames(&window, &seqs))
        };
        if !frames.is_empty() {
            log::debug!("[{tag}:timer] timeout — retransmitting {} packet(s)", frames.len());
        }
        ctx.send_frames(tag, frames).await?;
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// ReceiverSession
// ---------------------------------------------------------------------------

/// Receives one transfer and writes it, in order, to a sink.
pub struct ReceiverSession<C> {
    channel: C,
    config: SessionConfig,
}

impl<C: Channel> ReceiverSession<C> {
    pub fn new(channel: C, config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self { channel, config })
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    /// Receive until the transfer ends and return the counters.
    ///
    /// The first datagram fixes the peer; anything from other addresses is
    /// ignored.  The transfer ends on the terminal marker, or when the
    /// announced total has been written and the peer has been quiet for
    /// `linger`.  A peer that stays silent for `idle_timeout` is an error.
    pub async fn run<W>(&self, sink: &mut W) -> Result<ReceiveStats, SessionError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let started = Instant::now();
        let mut window = ReceiverWindow::new(&self.config);
        let tag = window.discipline().tag();
        let mut peer: Option<SocketAddr> = None;
        let mut last_heard = Instant::now();

        log::info!("[{tag}] listening on {}", self.channel.local_addr());

        loop {
            let received = self.channel.recv(self.config.poll_interval).await?;
            let now = Instant::now();

            let Some(dg) = received else {
                let quiet = now.saturating_duration_since(last_heard);
                let stats = window.stats();
                let all_written = stats
                    .announced_bytes
                    .is_some_and(|total| stats.delivered_bytes >= total);
                if all_written && quiet >= self.config.linger {
                    log::info!("[{tag}] all announced bytes written; no END after {quiet:?}");
                    break;
                }
                if quiet >= self.config.idle_timeout {
                    return Err(SessionError::PeerSilent(quiet));
                }
                continue;
            };

            match peer {
                None => {
                    log::debug!("[{tag}] peer is {}", dg.from);
                    peer = Some(dg.from);
                }
                Some(p) if p != dg.from => {
                    log::debug!("[{tag}] ignoring datagram from {}", dg.from);
                    continue;
                }
                Some(_) => {}
            }
            last_heard = now;

            if let Some(control) = Control::parse(&dg.bytes) {
                match control {
                    Control::Terminal => {
                        log::debug!("[{tag}] ← END");
                        window.stats_mut().terminal_marker_seen = true;
                        break;
                    }
                    Control::Bootstrap(total) => {
                        log::debug!("[{tag}] ← SIZE {total}");
                        window.stats_mut().announced_bytes = Some(total);
                    }
                    Control::Complete => {}
                }
                continue;
            }

            let verdict = window.on_datagram(&dg.bytes);
            for payload in &verdict.delivered {
                sink.write_all(payload).await?;
            }
            match verdict.event {
                RecvEvent::Accepted => log::debug!(
                    "[{tag}] ← DATA delivered {} packet(s), expected={}",
                    verdict.delivered.len(),
                    window.expected()
                ),
                event => log::debug!("[{tag}] ← {event:?}"),
            }
            if let Some(seq) = verdict.ack {
                self.channel.send(&window.ack_frame(seq), dg.from).await?;
                log::debug!("[{tag}] → ACK seq={seq}");
            }
        }

        sink.flush().await?;
        if let Some(peer) = peer {
            self.channel.send(&Control::Complete.to_bytes(), peer).await?;
            log::debug!("[{tag}] → DONE");
        }
        self.channel.flush().await?;

        let mut stats = window.stats().clone();
        stats.elapsed = started.elapsed();
        log::info!(
            "[{tag}] received {} bytes in {} packet(s) ({} duplicate, {} corrupt)",
            stats.delivered_bytes,
            stats.delivered_packets,
            stats.duplicates,
            stats.corrupt
        );
        Ok(stats)
    }
}
