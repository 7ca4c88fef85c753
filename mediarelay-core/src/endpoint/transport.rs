//! Network seam of the egress endpoint
//!
//! The RTP socket only sends and is connected to the peer. The adjacent RTCP
//! socket receives whatever the peer sends back (feedback and input).

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{Error, Result};

/// Bound RTP/RTCP socket pair of one session
#[async_trait]
pub trait PacketTransport: Send + Sync {
    /// Send one marshalled RTP packet to the peer
    async fn send(&self, packet: &[u8]) -> Result<usize>;

    /// Receive one inbound datagram
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;
}

/// Opens transports for new sessions
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        local_rtp: SocketAddr,
        local_rtcp: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Arc<dyn PacketTransport>>;
}

/// UDP sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpTransportFactory;

#[async_trait]
impl TransportFactory for UdpTransportFactory {
    async fn open(
        &self,
        local_rtp: SocketAddr,
        local_rtcp: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Arc<dyn PacketTransport>> {
        let rtp = UdpSocket::bind(local_rtp)
            .await
            .map_err(|e| Error::Bind(format!("rtp {local_rtp}: {e}")))?;
        rtp.connect(peer)
            .await
            .map_err(|e| Error::Bind(format!("connect {peer}: {e}")))?;
        let rtcp = UdpSocket::bind(local_rtcp)
            .await
            .map_err(|e| Error::Bind(format!("rtcp {local_rtcp}: {e}")))?;

        debug!(%local_rtp, %local_rtcp, %peer, "UDP transport opened");
        Ok(Arc::new(UdpTransport { rtp, rtcp }))
    }
}

struct UdpTransport {
    rtp: UdpSocket,
    rtcp: UdpSocket,
}

#[async_trait]
impl PacketTransport for UdpTransport {
    async fn send(&self, packet: &[u8]) -> Result<usize> {
        Ok(self.rtp.send(packet).await?)
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let (n, _) = self.rtcp.recv_from(buf).await?;
        Ok(n)
    }
}
