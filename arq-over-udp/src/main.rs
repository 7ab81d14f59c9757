//! Entry point for `arq-over-udp`.
//!
//! Parses CLI arguments and dispatches into either **send** or **recv** mode.
//! All protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, argument parsing, file I/O).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use arq_over_udp::{
    Channel, CorruptPolicy, Discipline, FaultConfig, IntegrityKind, LossyChannel, ReceiverSession,
    SenderSession, SessionConfig, UdpChannel,
};

/// Reliable file transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Send a file to a listening receiver.
    Send {
        /// Receiver address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        peer: SocketAddr,
        /// Local address to bind.
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
        /// File to send.
        file: PathBuf,
        /// Run the sender as three concurrent tasks instead of one loop.
        #[arg(long)]
        concurrent: bool,
        #[command(flatten)]
        session: SessionArgs,
        #[command(flatten)]
        faults: FaultArgs,
    },
    /// Receive one file and write it to disk.
    Recv {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        /// Output file.
        #[arg(short, long)]
        out: PathBuf,
        #[command(flatten)]
        session: SessionArgs,
        #[command(flatten)]
        faults: FaultArgs,
    },
}

/// Parameters both ends must agree on, plus local timing knobs.
#[derive(Args)]
struct SessionArgs {
    #[arg(short, long, value_enum, default_value_t = Discipline::GoBackN)]
    discipline: Discipline,
    /// Window size in packets (ignored for stop-and-wait).
    #[arg(short, long, default_value_t = 10)]
    window: usize,
    /// Payload bytes per packet.
    #[arg(long, default_value_t = 1000)]
    mss: usize,
    /// Fixed retransmission timeout in milliseconds.
    #[arg(long, default_value_t = 200)]
    rto_ms: u64,
    #[arg(long, value_enum, default_value_t = IntegrityKind::Checksum)]
    integrity: IntegrityKind,
    /// Receiver reaction to corrupt packets (stop-and-wait / go-back-n).
    #[arg(long, value_enum, default_value = "re-ack-last-good")]
    on_corrupt: CorruptPolicy,
    /// Seconds the receiver waits for a silent peer before giving up.
    #[arg(long, default_value_t = 30)]
    idle_secs: u64,
    /// Do not announce the total size before the first packet.
    #[arg(long)]
    no_announce: bool,
}

impl SessionArgs {
    fn to_config(&self) -> SessionConfig {
        SessionConfig {
            discipline: self.discipline,
            window: self.window,
            mss: self.mss,
            rto: Duration::from_millis(self.rto_ms),
            integrity: self.integrity,
            corrupt_policy: self.on_corrupt,
            idle_timeout: Duration::from_secs(self.idle_secs),
            announce_size: !self.no_announce,
            ..SessionConfig::default()
        }
    }
}

/// Faults injected on this end's outgoing datagrams.
#[derive(Args)]
struct FaultArgs {
    /// Probability of dropping an outgoing datagram.
    #[arg(long, default_value_t = 0.0)]
    loss: f64,
    /// Probability of flipping one bit of an outgoing datagram.
    #[arg(long, default_value_t = 0.0)]
    corrupt: f64,
    #[arg(long, default_value_t = 0.0)]
    reorder: f64,
    #[arg(long, default_value_t = 0.0)]
    duplicate: f64,
    /// RNG seed for the fault model.
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl FaultArgs {
    fn to_config(&self) -> FaultConfig {
        FaultConfig {
            loss_rate: self.loss,
            corrupt_rate: self.corrupt,
            reorder_rate: self.reorder,
            duplicate_rate: self.duplicate,
            seed: self.seed,
            spare_control: false,
        }
    }
}

async fn open_channel(
    bind: SocketAddr,
    faults: &FaultArgs,
) -> anyhow::Result<LossyChannel<UdpChannel>> {
    let udp = UdpChannel::bind(bind)
        .await
        .with_context(|| format!("cannot bind {bind}"))?;
    Ok(LossyChannel::new(udp, faults.to_config()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Send {
            peer,
            bind,
            file,
            concurrent,
            session,
            faults,
        } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("cannot read {}", file.display()))?;
            let channel = open_channel(bind, &faults).await?;
            log::info!("Sending {} from {} to {peer}", file.display(), channel.local_addr());

            let sender = SenderSession::new(channel, peer, session.to_config())?;
            let stats = if concurrent {
                sender.transfer_concurrent(&data).await?
            } else {
                sender.transfer(&data).await?
            };
            println!("{stats}");
        }
        Mode::Recv {
            bind,
            out,
            session,
            faults,
        } => {
            let channel = open_channel(bind, &faults).await?;
            log::info!("Receiving on {} into {}", channel.local_addr(), out.display());

            let mut sink = tokio::fs::File::create(&out)
                .await
                .with_context(|| format!("cannot create {}", out.display()))?;
            let receiver = ReceiverSession::new(channel, session.to_config())?;
            let stats = receiver.run(&mut sink).await?;
            println!("{stats}");
        }
    }
    Ok(())
}
