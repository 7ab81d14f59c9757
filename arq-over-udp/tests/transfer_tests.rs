//! End-to-end transfers over the loopback interface.
//!
//! Each test binds two real UDP sockets, runs the receiver in a background
//! task and the sender in the test task, then checks that the bytes written
//! by the receiver are exactly the bytes that were sent.

use std::net::SocketAddr;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use arq_over_udp::{
    packet::KIND_ACK, Channel, ChannelError, Datagram, Discipline, FaultConfig, IntegrityKind,
    LossyChannel, ReceiveStats, ReceiverSession, SenderSession, SessionConfig, SessionError,
    TransferStats, UdpChannel,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const BUDGET: Duration = Duration::from_secs(60);

async fn loopback() -> UdpChannel {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    UdpChannel::bind(addr).await.expect("bind failed")
}

/// Deterministic pseudo-random input.
fn input(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

fn config(discipline: Discipline) -> SessionConfig {
    SessionConfig {
        window: 10,
        mss: 1000,
        rto: Duration::from_millis(200),
        ..SessionConfig::for_discipline(discipline)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Cooperative,
    Concurrent,
}

/// Run one transfer to completion and return both sides' view of it.
async fn transfer<S, R>(
    sender_ch: S,
    receiver_ch: R,
    sender_cfg: SessionConfig,
    receiver_cfg: SessionConfig,
    data: &[u8],
    mode: Mode,
) -> (TransferStats, ReceiveStats, Vec<u8>)
where
    S: Channel + 'static,
    R: Channel + 'static,
{
    let receiver_addr = receiver_ch.local_addr();
    let receiver = tokio::spawn(async move {
        let session = ReceiverSession::new(receiver_ch, receiver_cfg).expect("receiver config");
        let mut out = Vec::new();
        let stats = session.run(&mut out).await.expect("receive failed");
        (stats, out)
    });

    let sender = SenderSession::new(sender_ch, receiver_addr, sender_cfg).expect("sender config");
    let sent = tokio::time::timeout(BUDGET, async {
        match mode {
            Mode::Cooperative => sender.transfer(data).await,
            Mode::Concurrent => sender.transfer_concurrent(data).await,
        }
    })
    .await
    .expect("sender exceeded its time budget")
    .expect("send failed");

    let (received, out) = tokio::time::timeout(BUDGET, receiver)
        .await
        .expect("receiver exceeded its time budget")
        .expect("receiver task panicked");
    (sent, received, out)
}

/// Flips one bit of the first ACK it carries; everything else passes.
struct CorruptFirstAck<C> {
    inner: C,
    done: AtomicBool,
}

impl<C> CorruptFirstAck<C> {
    fn new(inner: C) -> Self {
        Self {
            inner,
            done: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<C: Channel> Channel for CorruptFirstAck<C> {
    async fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), ChannelError> {
        if bytes.first() == Some(&KIND_ACK) && !self.done.swap(true, Ordering::SeqCst) {
            let mut bad = bytes.to_vec();
            bad[3] ^= 0x10;
            return self.inner.send(&bad, dest).await;
        }
        self.inner.send(bytes, dest).await
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Datagram>, ChannelError> {
        self.inner.recv(timeout).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }
}

/// Swallows the terminal marker.
struct DropTerminal<C>(C);

#[async_trait]
impl<C: Channel> Channel for DropTerminal<C> {
    async fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), ChannelError> {
        if bytes == arq_over_udp::packet::TERMINAL_MARKER {
            return Ok(());
        }
        self.0.send(bytes, dest).await
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Datagram>, ChannelError> {
        self.0.recv(timeout).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.0.local_addr()
    }
}

// ---------------------------------------------------------------------------
// Clean channel
// ---------------------------------------------------------------------------

/// 64 KB, W=10, MSS=1000, no faults: identical output and no retransmissions.
#[tokio::test]
async fn clean_transfer_needs_no_retransmission() {
    let data = input(64 * 1024, 1);

    for discipline in [
        Discipline::StopAndWait,
        Discipline::GoBackN,
        Discipline::SelectiveRepeat,
    ] {
        let cfg = config(discipline);
        let (sent, received, out) = transfer(
            loopback().await,
            loopback().await,
            cfg.clone(),
            cfg,
            &data,
            Mode::Cooperative,
        )
        .await;

        assert_eq!(out, data, "{discipline}: output differs");
        assert_eq!(sent.packets, 66);
        assert_eq!(sent.retransmissions, 0, "{discipline}");
        assert_eq!(sent.transmissions, 66);
        assert!(sent.completed, "{discipline}: no completion signal");
        assert_eq!(received.delivered_bytes, data.len() as u64);
        assert_eq!(received.announced_bytes, Some(data.len() as u64));
        assert!(received.terminal_marker_seen);
        assert_eq!(received.duplicates, 0);
    }
}

#[tokio::test]
async fn clean_transfer_with_concurrent_sender() {
    let data = input(64 * 1024, 2);

    for discipline in [
        Discipline::StopAndWait,
        Discipline::GoBackN,
        Discipline::SelectiveRepeat,
    ] {
        let cfg = config(discipline);
        let (sent, _, out) = transfer(
            loopback().await,
            loopback().await,
            cfg.clone(),
            cfg,
            &data,
            Mode::Concurrent,
        )
        .await;

        assert_eq!(out, data, "{discipline}: output differs");
        assert_eq!(sent.retransmissions, 0, "{discipline}");
        assert!(sent.completed);
    }
}

#[tokio::test]
async fn crc16_codec_carries_a_transfer() {
    let data = input(20_000, 3);
    let cfg = SessionConfig {
        integrity: IntegrityKind::Crc16,
        ..config(Discipline::SelectiveRepeat)
    };
    let (_, received, out) = transfer(
        loopback().await,
        loopback().await,
        cfg.clone(),
        cfg,
        &data,
        Mode::Cooperative,
    )
    .await;
    assert_eq!(out, data);
    assert_eq!(received.corrupt, 0);
}

#[tokio::test]
async fn empty_input_still_terminates() {
    let cfg = config(Discipline::GoBackN);
    let (sent, received, out) = transfer(
        loopback().await,
        loopback().await,
        cfg.clone(),
        cfg,
        &[],
        Mode::Cooperative,
    )
    .await;
    assert!(out.is_empty());
    assert_eq!(sent.packets, 0);
    assert_eq!(sent.transmissions, 0);
    assert_eq!(received.announced_bytes, Some(0));
    assert!(received.terminal_marker_seen);
}

#[tokio::test]
async fn last_packet_may_be_short() {
    let data = input(2_500, 4);
    let cfg = config(Discipline::GoBackN);
    let (sent, received, out) = transfer(
        loopback().await,
        loopback().await,
        cfg.clone(),
        cfg,
        &data,
        Mode::Cooperative,
    )
    .await;
    assert_eq!(out, data);
    assert_eq!(sent.packets, 3);
    assert_eq!(received.delivered_packets, 3);
}

// ---------------------------------------------------------------------------
// Lossy channel
// ---------------------------------------------------------------------------

/// 20 % loss on both DATA and ACK paths with a 200 ms RTO: the transfer still
/// finishes within budget with identical output, and needed retransmissions.
#[tokio::test]
async fn twenty_percent_loss_both_ways() {
    let data = input(64 * 1024, 5);

    for (i, discipline) in [Discipline::GoBackN, Discipline::SelectiveRepeat]
        .into_iter()
        .enumerate()
    {
        let faults = |seed| FaultConfig {
            spare_control: true,
            ..FaultConfig::lossy(0.2, seed)
        };
        let sender_ch = LossyChannel::new(loopback().await, faults(10 + i as u64));
        let receiver_ch = LossyChannel::new(loopback().await, faults(20 + i as u64));

        let cfg = config(discipline);
        let (sent, received, out) = transfer(
            sender_ch,
            receiver_ch,
            cfg.clone(),
            cfg,
            &data,
            Mode::Cooperative,
        )
        .await;

        assert_eq!(out, data, "{discipline}: output differs");
        assert!(sent.retransmissions > 0, "{discipline}: no retransmissions");
        assert!(sent.timeouts > 0);
        assert_eq!(received.delivered_bytes, data.len() as u64);
    }
}

#[tokio::test]
async fn lossy_transfer_with_concurrent_sender() {
    let data = input(32 * 1024, 6);
    let faults = |seed| FaultConfig {
        spare_control: true,
        ..FaultConfig::lossy(0.2, seed)
    };
    let cfg = config(Discipline::GoBackN);
    let (sent, _, out) = transfer(
        LossyChannel::new(loopback().await, faults(31)),
        LossyChannel::new(loopback().await, faults(32)),
        cfg.clone(),
        cfg,
        &data,
        Mode::Concurrent,
    )
    .await;
    assert_eq!(out, data);
    assert!(sent.retransmissions > 0);
}

#[tokio::test]
async fn survives_duplication_reordering_and_corruption() {
    let data = input(16 * 1024, 7);
    let faults = |seed| FaultConfig {
        loss_rate: 0.05,
        corrupt_rate: 0.05,
        reorder_rate: 0.1,
        duplicate_rate: 0.1,
        seed,
        spare_control: true,
    };

    for discipline in [
        Discipline::StopAndWait,
        Discipline::GoBackN,
        Discipline::SelectiveRepeat,
    ] {
        let cfg = config(discipline);
        let (_, received, out) = transfer(
            LossyChannel::new(loopback().await, faults(41)),
            LossyChannel::new(loopback().await, faults(42)),
            cfg.clone(),
            cfg,
            &data,
            Mode::Cooperative,
        )
        .await;
        assert_eq!(out, data, "{discipline}: output differs");
        assert_eq!(received.delivered_bytes, data.len() as u64);
    }
}

// ---------------------------------------------------------------------------
// One corrupted ACK
// ---------------------------------------------------------------------------

/// A single corrupted ACK costs exactly one retransmission of that packet.
#[tokio::test]
async fn one_corrupt_ack_costs_one_retransmission() {
    let data = input(8_000, 8);

    for discipline in [Discipline::StopAndWait, Discipline::SelectiveRepeat] {
        let cfg = config(discipline);
        let (sent, received, out) = transfer(
            loopback().await,
            CorruptFirstAck::new(loopback().await),
            cfg.clone(),
            cfg,
            &data,
            Mode::Cooperative,
        )
        .await;

        assert_eq!(out, data, "{discipline}: output differs");
        assert_eq!(sent.corrupt_acks, 1, "{discipline}");
        assert_eq!(sent.retransmissions, 1, "{discipline}");
        assert_eq!(sent.transmissions, sent.packets as u64 + 1);
        // The retransmitted packet reaches the receiver a second time.
        assert_eq!(received.duplicates, 1, "{discipline}");
        assert!(sent.completed);
    }
}

// ---------------------------------------------------------------------------
// Termination edge cases
// ---------------------------------------------------------------------------

/// Without END the receiver finishes once the announced total is written and
/// the peer has gone quiet.
#[tokio::test]
async fn lost_terminal_marker_falls_back_to_announced_size() {
    let data = input(10_000, 9);
    let sender_cfg = SessionConfig {
        linger: Duration::from_secs(5),
        ..config(Discipline::GoBackN)
    };
    let receiver_cfg = SessionConfig {
        linger: Duration::from_millis(300),
        ..config(Discipline::GoBackN)
    };

    let (sent, received, out) = transfer(
        DropTerminal(loopback().await),
        loopback().await,
        sender_cfg,
        receiver_cfg,
        &data,
        Mode::Cooperative,
    )
    .await;

    assert_eq!(out, data);
    assert!(!received.terminal_marker_seen);
    assert!(sent.completed, "DONE should still reach the sender");
}

#[tokio::test]
async fn silent_peer_is_reported() {
    let cfg = SessionConfig {
        idle_timeout: Duration::from_millis(200),
        ..SessionConfig::default()
    };
    let session = ReceiverSession::new(loopback().await, cfg).unwrap();
    let mut out = Vec::new();
    let err = session.run(&mut out).await.unwrap_err();
    assert!(matches!(err, SessionError::PeerSilent(_)), "got {err:?}");
}

#[tokio::test]
async fn missing_receiver_leaves_completion_unset() {
    // This socket never answers, so DONE never arrives for the empty
    // transfer; the sender gives up after `linger`.
    let nobody = loopback().await;
    let peer = nobody.local_addr();

    let cfg = SessionConfig {
        linger: Duration::from_millis(200),
        ..SessionConfig::default()
    };
    let sender = SenderSession::new(loopback().await, peer, cfg).unwrap();
    let stats = sender.transfer(&[]).await.unwrap();
    assert!(!stats.completed);
}

// ---------------------------------------------------------------------------
// Held datagrams and failing tasks
// ---------------------------------------------------------------------------

/// Every other datagram the sender emits is held back, END included; the
/// session flushes it out instead of leaving it held forever.
#[tokio::test]
async fn reordered_terminal_marker_still_arrives() {
    let data = input(500, 12);
    let faults = FaultConfig {
        reorder_rate: 1.0,
        seed: 12,
        ..FaultConfig::default()
    };

    for mode in [Mode::Cooperative, Mode::Concurrent] {
        let cfg = config(Discipline::GoBackN);
        let (sent, received, out) = transfer(
            LossyChannel::new(loopback().await, faults.clone()),
            loopback().await,
            cfg.clone(),
            cfg,
            &data,
            mode,
        )
        .await;

        assert_eq!(out, data);
        assert!(received.terminal_marker_seen, "END was never released");
        assert!(sent.completed, "no completion signal");
    }
}

/// Accepts `budget` sends, then every send fails.  Never receives anything.
struct FailAfter {
    budget: usize,
    sends: AtomicUsize,
    recvs: AtomicUsize,
}

impl FailAfter {
    fn new(budget: usize) -> Self {
        Self {
            budget,
            sends: AtomicUsize::new(0),
            recvs: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> (usize, usize) {
        (
            self.sends.load(Ordering::SeqCst),
            self.recvs.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl Channel for FailAfter {
    async fn send(&self, _bytes: &[u8], _dest: SocketAddr) -> Result<(), ChannelError> {
        if self.sends.fetch_add(1, Ordering::SeqCst) >= self.budget {
            return Err(ChannelError::Io(io::Error::other("link down")));
        }
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Datagram>, ChannelError> {
        self.recvs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    fn local_addr(&self) -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }
}

/// Panics on the first receive.
struct PanicOnRecv;

#[async_trait]
impl Channel for PanicOnRecv {
    async fn send(&self, _bytes: &[u8], _dest: SocketAddr) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn recv(&self, _timeout: Duration) -> Result<Option<Datagram>, ChannelError> {
        panic!("receive path failed");
    }

    fn local_addr(&self) -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }
}

#[tokio::test]
async fn failing_send_stops_every_concurrent_task() {
    let peer: SocketAddr = "127.0.0.1:7".parse().unwrap();
    let cfg = config(Discipline::GoBackN);
    let poll = cfg.poll_interval;
    let sender = SenderSession::new(FailAfter::new(3), peer, cfg).unwrap();

    let data = input(20_000, 13);
    let result = tokio::time::timeout(Duration::from_secs(5), sender.transfer_concurrent(&data))
        .await
        .expect("transfer hung after a task failed");
    assert!(matches!(result, Err(SessionError::Channel(_))), "got {result:?}");

    // Nothing is still polling the channel once the call has returned.
    let calls = sender.channel().calls();
    tokio::time::sleep(poll * 4).await;
    assert_eq!(sender.channel().calls(), calls);
}

#[tokio::test]
async fn panicking_task_stops_its_siblings() {
    let peer: SocketAddr = "127.0.0.1:7".parse().unwrap();
    let cfg = config(Discipline::SelectiveRepeat);
    let sender = SenderSession::new(PanicOnRecv, peer, cfg).unwrap();

    let data = input(20_000, 14);
    let result = tokio::time::timeout(Duration::from_secs(5), sender.transfer_concurrent(&data))
        .await
        .expect("transfer hung after a task panicked");
    assert!(matches!(result, Err(SessionError::Task(_))), "got {result:?}");
}
