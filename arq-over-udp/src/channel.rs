//! Datagram transport seam.
//!
//! The ARQ engine needs exactly two things from the network: send a datagram
//! to an address, and receive the next datagram or give up after a timeout.
//! [`Channel`] is that seam.  [`UdpChannel`] is the real implementation over
//! `tokio::net::UdpSocket`; [`crate::simulator::LossyChannel`] wraps any
//! channel to inject faults, and tests wrap channels to script them.
//!
//! Channels move raw bytes only.  Framing and integrity live in
//! [`crate::packet`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;

/// Maximum UDP payload size.
const MAX_DATAGRAM: usize = 65_535;

/// Errors that can arise from channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One received datagram and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub from: SocketAddr,
}

/// An unreliable datagram transport.
///
/// Datagrams may be lost, duplicated, reordered or corrupted; callers must
/// not assume otherwise.  All methods take `&self` so one channel can be
/// shared between concurrent activities.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send `bytes` as one datagram to `dest`.
    async fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), ChannelError>;

    /// Wait up to `timeout` for the next datagram.  `Ok(None)` means the
    /// timeout elapsed, which is a normal event.
    async fn recv(&self, timeout: Duration) -> Result<Option<Datagram>, ChannelError>;

    /// Address this channel receives on.
    fn local_addr(&self) -> SocketAddr;

    /// Send anything the channel is still holding back.  Sessions call this
    /// after their last datagram.  Plain transports hold nothing.
    async fn flush(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[async_trait]
impl<C: Channel + ?Sized> Channel for Arc<C> {
    async fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), ChannelError> {
        (**self).send(bytes, dest).await
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Datagram>, ChannelError> {
        (**self).recv(timeout).await
    }

    fn local_addr(&self) -> SocketAddr {
        (**self).local_addr()
    }

    async fn flush(&self) -> Result<(), ChannelError> {
        (**self).flush().await
    }
}

// ---------------------------------------------------------------------------
// UdpChannel
// ---------------------------------------------------------------------------

/// A [`Channel`] over a bound UDP socket.
#[derive(Debug)]
pub struct UdpChannel {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    local_addr: SocketAddr,
    inner: UdpSocket,
}

impl UdpChannel {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port `0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, ChannelError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }
}

#[async_trait]
impl Channel for UdpChannel {
    async fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), ChannelError> {
        self.inner.send_to(bytes, dest).await?;
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Datagram>, ChannelError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match tokio::time::timeout(timeout, self.inner.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                buf.truncate(n);
                Ok(Some(Datagram { bytes: buf, from }))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Ok(None),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
