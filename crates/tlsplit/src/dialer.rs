use crate::port_range::PortRange;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{TcpSocket, TcpStream};

/// Opens connections to destinations, optionally from a fixed source
/// address and port range.
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    pub source_ip: Option<IpAddr>,
    pub port_range: Option<PortRange>,
}

impl Dialer {
    pub async fn connect(&self, destination: SocketAddr) -> std::io::Result<TcpStream> {
        let socket = match destination {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };

        if let Some(local) = self.local_address(destination)? {
            socket.bind(local)?;
        }

        socket.connect(destination).await
    }

    /// The address to bind to before connecting, if any
    fn local_address(&self, destination: SocketAddr) -> std::io::Result<Option<SocketAddr>> {
        if self.source_ip.is_none() && self.port_range.is_none() {
            return Ok(None);
        }

        let ip = self.source_ip.unwrap_or(match destination {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        let port = match &self.port_range {
            Some(range) => range.take_out(ip).map_err(|err| {
                std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, err)
            })?,
            None => 0,
        };
        Ok(Some(SocketAddr::new(ip, port)))
    }
}
