//! UDP transport for CoAP sessions.
//!
//! The engine only talks to the network through [`PacketConn`], so tests can
//! substitute their own datagram transport. [`UdpTransport`] is the tokio
//! implementation, with the multicast plumbing (group membership, loopback,
//! outgoing interface selection) done through `socket2`.

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Default multicast hop limit
pub const DEFAULT_HOP_LIMIT: u32 = 2;

/// Largest length a UDP header can describe
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Network interface used for multicast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastInterface {
    /// IPv4 interface, identified by one of its addresses
    V4(Ipv4Addr),
    /// IPv6 interface index
    V6(u32),
}

/// Interfaces a multicast request is sent on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InterfaceSelection {
    /// Let the OS route the datagram
    #[default]
    Any,
    /// Exactly one interface
    Single(MulticastInterface),
    /// Every listed interface, one datagram each
    Each(Vec<MulticastInterface>),
}

/// Options for sending to a multicast group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastOptions {
    /// Outgoing interfaces
    pub interfaces: InterfaceSelection,
    /// TTL (IPv4) or hop limit (IPv6)
    pub hop_limit: u32,
}

impl Default for MulticastOptions {
    fn default() -> Self {
        Self {
            interfaces: InterfaceSelection::Any,
            hop_limit: DEFAULT_HOP_LIMIT,
        }
    }
}

impl MulticastOptions {
    /// Send on one interface
    pub fn on_interface(mut self, iface: MulticastInterface) -> Self {
        self.interfaces = InterfaceSelection::Single(iface);
        self
    }

    /// Send on each of the given interfaces
    pub fn on_interfaces(mut self, ifaces: Vec<MulticastInterface>) -> Self {
        self.interfaces = InterfaceSelection::Each(ifaces);
        self
    }

    /// Set the hop limit
    pub fn hop_limit(mut self, hop_limit: u32) -> Self {
        self.hop_limit = hop_limit;
        self
    }
}

/// Datagram transport consumed by the server and the client
#[async_trait]
pub trait PacketConn: Send + Sync + fmt::Debug {
    /// Receive one datagram
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send one datagram to a unicast peer
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Send one datagram to a multicast group
    async fn send_multicast(
        &self,
        buf: &[u8],
        group: SocketAddr,
        opts: &MulticastOptions,
    ) -> io::Result<()>;

    /// Local socket address
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// tokio `UdpSocket` transport
pub struct UdpTransport {
    socket: UdpSocket,
    // interface selection and send must not interleave between multicast sends
    multicast_lock: Mutex<()>,
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local_addr", &self.socket.local_addr().ok())
            .finish()
    }
}

impl UdpTransport {
    /// Bind a unicast socket
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(local_addr = ?socket.local_addr().ok(), "UDP transport bound");
        Ok(Self::from_socket(socket))
    }

    /// Wrap an already bound socket
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            multicast_lock: Mutex::new(()),
        }
    }

    /// Bind to the group's port on the unspecified address with address
    /// reuse, ready to join the group.
    pub fn listen_multicast(group: SocketAddr) -> io::Result<Self> {
        let domain = Domain::for_address(group);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;

        let bind_addr: SocketAddr = match group {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, group.port()).into(),
            SocketAddr::V6(_) => {
                socket.set_only_v6(true)?;
                (Ipv6Addr::UNSPECIFIED, group.port()).into()
            }
        };
        socket.bind(&bind_addr.into())?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        info!(%group, "Multicast listener bound");
        Ok(Self::from_socket(socket))
    }

    /// Join `group` on `iface` (or the default interface)
    pub fn join_group(&self, group: IpAddr, iface: Option<MulticastInterface>) -> io::Result<()> {
        match group {
            IpAddr::V4(group) => {
                let iface = match iface {
                    Some(MulticastInterface::V4(addr)) => addr,
                    _ => Ipv4Addr::UNSPECIFIED,
                };
                self.socket.join_multicast_v4(group, iface)?;
            }
            IpAddr::V6(group) => {
                let index = match iface {
                    Some(MulticastInterface::V6(index)) => index,
                    _ => 0,
                };
                self.socket.join_multicast_v6(&group, index)?;
            }
        }
        debug!(%group, ?iface, "Joined multicast group");
        Ok(())
    }

    /// Leave `group` on `iface` (or the default interface)
    pub fn leave_group(&self, group: IpAddr, iface: Option<MulticastInterface>) -> io::Result<()> {
        match group {
            IpAddr::V4(group) => {
                let iface = match iface {
                    Some(MulticastInterface::V4(addr)) => addr,
                    _ => Ipv4Addr::UNSPECIFIED,
                };
                self.socket.leave_multicast_v4(group, iface)
            }
            IpAddr::V6(group) => {
                let index = match iface {
                    Some(MulticastInterface::V6(index)) => index,
                    _ => 0,
                };
                self.socket.leave_multicast_v6(&group, index)
            }
        }
    }

    /// Enable or disable loopback of our own multicast datagrams
    pub fn set_multicast_loopback(&self, enabled: bool) -> io::Result<()> {
        match self.socket.local_addr()? {
            SocketAddr::V4(_) => self.socket.set_multicast_loop_v4(enabled),
            SocketAddr::V6(_) => self.socket.set_multicast_loop_v6(enabled),
        }
    }

    fn select_interface(&self, iface: &MulticastInterface) -> io::Result<()> {
        let sock = SockRef::from(&self.socket);
        match iface {
            MulticastInterface::V4(addr) => sock.set_multicast_if_v4(addr),
            MulticastInterface::V6(index) => sock.set_multicast_if_v6(*index),
        }
    }

    /// Hand interface choice back to the routing table
    fn reset_interface(&self, group: SocketAddr) -> io::Result<()> {
        let sock = SockRef::from(&self.socket);
        match group {
            SocketAddr::V4(_) => sock.set_multicast_if_v4(&Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => sock.set_multicast_if_v6(0),
        }
    }

    fn set_hop_limit(&self, group: SocketAddr, hop_limit: u32) -> io::Result<()> {
        let sock = SockRef::from(&self.socket);
        match group {
            SocketAddr::V4(_) => sock.set_multicast_ttl_v4(hop_limit),
            SocketAddr::V6(_) => sock.set_multicast_hops_v6(hop_limit),
        }
    }
}

#[async_trait]
impl PacketConn for UdpTransport {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target).await
    }

    async fn send_multicast(
        &self,
        buf: &[u8],
        group: SocketAddr,
        opts: &MulticastOptions,
    ) -> io::Result<()> {
        let _guard = self.multicast_lock.lock().await;
        self.set_hop_limit(group, opts.hop_limit)?;

        match &opts.interfaces {
            InterfaceSelection::Any => {
                self.reset_interface(group)?;
                self.socket.send_to(buf, group).await?;
            }
            InterfaceSelection::Single(iface) => {
                self.select_interface(iface)?;
                self.socket.send_to(buf, group).await?;
            }
            InterfaceSelection::Each(ifaces) => {
                for iface in ifaces {
                    self.select_interface(iface)?;
                    self.socket.send_to(buf, group).await?;
                }
            }
        }
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Unspecified address of the same family as `peer`, port 0
pub(crate) fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}
