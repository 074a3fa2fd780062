use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Determines where an accepted client connection was headed
pub trait DestinationResolver: Send + Sync {
    fn resolve(&self, socket: &TcpStream) -> std::io::Result<SocketAddr>;
}

/// Reads the pre-redirect destination that netfilter recorded for a
/// connection diverted to the proxy by an iptables `REDIRECT` or
/// `TPROXY` rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginalDestination;

#[cfg(target_os = "linux")]
impl DestinationResolver for OriginalDestination {
    fn resolve(&self, socket: &TcpStream) -> std::io::Result<SocketAddr> {
        use nix::sys::socket::{getsockopt, sockopt};
        use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

        match socket.local_addr()? {
            SocketAddr::V4(_) => {
                let addr = getsockopt(socket, sockopt::OriginalDst)?;
                Ok(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                    u16::from_be(addr.sin_port),
                )))
            }
            SocketAddr::V6(_) => {
                let addr = getsockopt(socket, sockopt::Ip6tOriginalDst)?;
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(addr.sin6_addr.s6_addr),
                    u16::from_be(addr.sin6_port),
                    addr.sin6_flowinfo,
                    addr.sin6_scope_id,
                )))
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl DestinationResolver for OriginalDestination {
    fn resolve(&self, _socket: &TcpStream) -> std::io::Result<SocketAddr> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "original destination lookup requires Linux netfilter",
        ))
    }
}

/// Sends every connection to the same place
#[derive(Debug, Clone, Copy)]
pub struct FixedDestination(pub SocketAddr);

impl DestinationResolver for FixedDestination {
    fn resolve(&self, _socket: &TcpStream) -> std::io::Result<SocketAddr> {
        Ok(self.0)
    }
}
