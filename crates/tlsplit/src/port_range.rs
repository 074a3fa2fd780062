use rand::Rng;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("invalid port range {0:?}: expected START-END")]
    Syntax(String),
    #[error("invalid port range {0:?}: ports must be between 1 and 65535")]
    OutOfRange(String),
    #[error("invalid port range {0:?}: start is greater than end")]
    Inverted(String),
    #[error("no free port found in {start}-{end}")]
    Exhausted { start: u16, end: u16 },
}

/// A range of local ports to bind outbound connections to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn port_count(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Pick a free port in the range.
    /// Ports are tried at random, as many times as there are ports in
    /// the range.
    pub fn take_out(&self, ip: IpAddr) -> Result<u16, PortRangeError> {
        let mut rng = rand::thread_rng();
        for _ in 0..self.port_count() {
            let port = rng.gen_range(self.start..=self.end);
            if is_port_available(ip, port) {
                return Ok(port);
            }
        }
        Err(PortRangeError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }
}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| PortRangeError::Syntax(s.to_string()))?;
        let parse = |port: &str| -> Result<u16, PortRangeError> {
            let port: u32 = port
                .trim()
                .parse()
                .map_err(|_| PortRangeError::Syntax(s.to_string()))?;
            u16::try_from(port)
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| PortRangeError::OutOfRange(s.to_string()))
        };
        let start = parse(start)?;
        let end = parse(end)?;
        if start > end {
            return Err(PortRangeError::Inverted(s.to_string()));
        }
        Ok(Self { start, end })
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}-{}", self.start, self.end)
    }
}

/// Returns true if `port` can currently be bound on `ip`
pub fn is_port_available(ip: IpAddr, port: u16) -> bool {
    TcpListener::bind(SocketAddr::new(ip, port)).is_ok()
}
