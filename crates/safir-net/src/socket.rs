//! C1 Datagram I/O: unicast (+ optional multicast) UDP sockets and the
//! cooperative receive-pause loop that backs off when the upper layer
//! reports it can't keep up.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use derive_more::{Display, Error, From};
use safir_core::ConfigError;
use tokio::net::UdpSocket;
use tracing::warn;

/// Failure to stand up a [`DatagramSocket`].
#[derive(Debug, Display, Error, From)]
pub enum BindError {
    #[display("{_0} is not a valid \"ip:port\" socket address")]
    #[from(ignore)]
    #[error(ignore)]
    InvalidAddress(String),
    Config(ConfigError),
    Io(std::io::Error),
}

/// One received datagram, tagged with which socket it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    Unicast(Vec<u8>, SocketAddr),
    Multicast(Vec<u8>, SocketAddr),
}

impl RecvOutcome {
    #[must_use]
    pub fn into_parts(self) -> (Vec<u8>, SocketAddr) {
        match self {
            Self::Unicast(buf, addr) | Self::Multicast(buf, addr) => (buf, addr),
        }
    }
}

fn unspecified_for(addr: SocketAddr) -> IpAddr {
    if addr.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }
}

/// The unicast socket every node has, plus an optional multicast socket for
/// node types that opted in. Bind address is always `0.0.0.0`/`::` on the
/// configured port; `"ip:port"` in the endpoint string only selects the
/// port and address family, per the fabric's wire addressing convention.
#[derive(Debug)]
pub struct DatagramSocket {
    unicast: UdpSocket,
    multicast: Option<UdpSocket>,
    receive_buffer_size: usize,
}

impl DatagramSocket {
    /// Fails hard if `multicast_endpoint` is `Some` and its IP family
    /// differs from `unicast_endpoint`'s.
    pub async fn bind(
        unicast_endpoint: &str,
        multicast_endpoint: Option<&str>,
        receive_buffer_size: usize,
    ) -> Result<Self, BindError> {
        let unicast_addr: SocketAddr = unicast_endpoint
            .parse()
            .map_err(|_| BindError::InvalidAddress(unicast_endpoint.to_owned()))?;
        let unicast = UdpSocket::bind(SocketAddr::new(unspecified_for(unicast_addr), unicast_addr.port())).await?;

        let multicast = match multicast_endpoint {
            None => None,
            Some(mcast_endpoint) => {
                let mcast_addr: SocketAddr = mcast_endpoint
                    .parse()
                    .map_err(|_| BindError::InvalidAddress(mcast_endpoint.to_owned()))?;
                if mcast_addr.is_ipv4() != unicast_addr.is_ipv4() {
                    return Err(BindError::Config(ConfigError::MixedIpVersions {
                        unicast: unicast_endpoint.to_owned(),
                        multicast: mcast_endpoint.to_owned(),
                    }));
                }
                let socket =
                    UdpSocket::bind(SocketAddr::new(unspecified_for(mcast_addr), mcast_addr.port())).await?;
                match mcast_addr.ip() {
                    IpAddr::V4(ip) => {
                        socket.join_multicast_v4(ip, Ipv4Addr::UNSPECIFIED)?;
                        socket.set_multicast_loop_v4(true)?;
                    }
                    IpAddr::V6(ip) => {
                        socket.join_multicast_v6(&ip, 0)?;
                        socket.set_multicast_loop_v6(true)?;
                    }
                }
                Some(socket)
            }
        };

        Ok(Self {
            unicast,
            multicast,
            receive_buffer_size,
        })
    }

    #[must_use]
    pub fn has_multicast(&self) -> bool {
        self.multicast.is_some()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.unicast.local_addr()
    }

    /// Races the unicast and (if present) multicast sockets; returns
    /// whichever produces a datagram first.
    pub async fn recv(&self) -> std::io::Result<RecvOutcome> {
        let mut unicast_buf = vec![0u8; self.receive_buffer_size];
        match &self.multicast {
            Some(multicast) => {
                let mut multicast_buf = vec![0u8; self.receive_buffer_size];
                tokio::select! {
                    res = self.unicast.recv_from(&mut unicast_buf) => {
                        let (n, addr) = res?;
                        unicast_buf.truncate(n);
                        Ok(RecvOutcome::Unicast(unicast_buf, addr))
                    }
                    res = multicast.recv_from(&mut multicast_buf) => {
                        let (n, addr) = res?;
                        multicast_buf.truncate(n);
                        Ok(RecvOutcome::Multicast(multicast_buf, addr))
                    }
                }
            }
            None => {
                let (n, addr) = self.unicast.recv_from(&mut unicast_buf).await?;
                unicast_buf.truncate(n);
                Ok(RecvOutcome::Unicast(unicast_buf, addr))
            }
        }
    }

    pub async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> std::io::Result<()> {
        self.unicast.send_to(bytes, addr).await?;
        Ok(())
    }

    /// Sends on the multicast socket if one is open, else falls back to a
    /// plain unicast write to `group` (the caller is expected to only pass
    /// a real multicast group address when `has_multicast()` is true).
    pub async fn send_multicast(&self, bytes: &[u8], group: SocketAddr) -> std::io::Result<()> {
        match &self.multicast {
            Some(socket) => socket.send_to(bytes, group).await.map(|_| ()),
            None => self.unicast.send_to(bytes, group).await.map(|_| ()),
        }
    }

    /// Cooperative receive-pause loop: feeds each datagram to `on_recv`;
    /// when it returns `false` (receiver saturated), polls
    /// `is_receiver_ready` every 10 ms until it returns `true` before
    /// resuming reception.
    pub async fn run_receive_loop<OnRecv, IsReady>(&self, mut on_recv: OnRecv, is_receiver_ready: IsReady)
    where
        OnRecv: FnMut(&[u8], SocketAddr) -> bool,
        IsReady: Fn() -> bool,
    {
        loop {
            let outcome = match self.recv().await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(%err, "datagram receive failed");
                    continue;
                }
            };
            let (buf, addr) = outcome.into_parts();
            if !on_recv(&buf, addr) {
                let mut interval = tokio::time::interval(Duration::from_millis(10));
                loop {
                    interval.tick().await;
                    if is_receiver_ready() {
                        break;
                    }
                }
            }
        }
    }
}
