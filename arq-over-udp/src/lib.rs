//! `arq-over-udp` — reliable, in-order file transfer over UDP with a
//! sliding-window ARQ engine (Stop-and-Wait, Go-Back-N, Selective-Repeat).
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐   DATA    ┌────────────────┐
//!  │ SenderWindow │──────────▶│ ReceiverWindow │──▶ output sink
//!  └──────┬───────┘           └───────┬────────┘
//!         │          ACKs             │
//!         │◀──────────────────────────┘
//!         │
//!  ┌──────▼────────────────────────────┐
//!  │  SenderSession / ReceiverSession  │
//!  │  (owns window + channel, I/O loop)│
//!  └──────┬────────────────────────────┘
//!         │ raw datagrams
//!  ┌──────▼──────┐
//!  │   Channel   │  (UdpChannel, or LossyChannel wrapping one)
//!  └─────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]     — wire format, integrity-checked encode / decode, control markers
//! - [`integrity`]  — Internet checksum and CRC-16 codecs
//! - [`sender`]     — send-side window: admission, ACK processing, retransmission
//! - [`receiver`]   — receive-side window: in-order delivery, buffering, ACK choice
//! - [`timer`]      — retransmission timers (single and per-seq)
//! - [`channel`]    — datagram transport trait and its UDP implementation
//! - [`simulator`]  — seeded loss / corruption / reordering / duplication layer
//! - [`session`]    — the I/O loops that drive both windows
//! - [`config`]     — per-transfer parameters and their validation
//! - [`stats`]      — end-of-transfer counters

pub mod channel;
pub mod config;
pub mod integrity;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod simulator;
pub mod stats;
pub mod timer;

pub use channel::{Channel, ChannelError, Datagram, UdpChannel};
pub use config::{CorruptPolicy, Discipline, IntegrityKind, SessionConfig};
pub use packet::{Control, Packet, PacketCodec, PacketError};
pub use session::{ReceiverSession, SenderSession, SessionError};
pub use simulator::{FaultConfig, LossyChannel};
pub use stats::{ReceiveStats, TransferStats};
