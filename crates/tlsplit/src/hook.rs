//! The observer contract through which traffic and connection summaries
//! leave the proxy.
use crate::filter::{FilterDecision, FilterRequest};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which leg of the connection a [`CommEvent`] describes.
///
/// While the destination leg is plain the proxy is a wire between the
/// two peers and only [`Direction::SrcToDst`] and [`Direction::DstToSrc`]
/// are used. Once the proxy speaks for the client on a TLS leg the four
/// proxy relative directions are used instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Generated by the proxy itself
    Proxy,
    SrcToPxy,
    PxyToDst,
    DstToPxy,
    PxyToSrc,
    SrcToDst,
    DstToSrc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proxy => "--",
            Self::SrcToPxy => "->|",
            Self::PxyToDst => "|->",
            Self::DstToPxy => "|<-",
            Self::PxyToSrc => "<-|",
            Self::SrcToDst => "->",
            Self::DstToSrc => "<-",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// One unit of traffic, or a status message generated by the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommEvent {
    pub conn_id: String,
    pub occurred_at: DateTime<Utc>,
    /// The payload with CR and LF spelled out as `\r` and `\n`
    pub data: String,
    pub direction: Direction,
}

impl CommEvent {
    pub fn new(conn_id: &str, data: &[u8], direction: Direction) -> Self {
        Self {
            conn_id: conn_id.to_string(),
            occurred_at: Utc::now(),
            data: escape_crlf(data),
            direction,
        }
    }
}

fn escape_crlf(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

/// The summary emitted once when a connection closes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnEvent {
    pub conn_id: String,
    pub occurred_at: DateTime<Utc>,
    /// The envelope sender, or `"unknown"`
    pub mail_from: String,
    /// The envelope recipient, or `"unknown"`
    pub mail_to: String,
    pub elapse: Elapse,
}

pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Time from connecting to the destination until it was ready to
/// receive message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elapse {
    Measured(Duration),
    /// The connection time was never recorded
    NotConnected,
    /// The destination never responded with 354
    DataNotStarted,
}

impl Elapse {
    pub fn between(connected_at: Option<Instant>, data_started_at: Option<Instant>) -> Self {
        match (connected_at, data_started_at) {
            (None, _) => Self::NotConnected,
            (Some(_), None) => Self::DataNotStarted,
            (Some(connected), Some(started)) => {
                Self::Measured(started.saturating_duration_since(connected))
            }
        }
    }

    /// Milliseconds, with `-1` and `-2` standing in for the two
    /// unavailable cases.
    pub fn as_millis(&self) -> i64 {
        match self {
            Self::Measured(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
            Self::NotConnected => -1,
            Self::DataNotStarted => -2,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Measured(_))
    }
}

impl std::fmt::Display for Elapse {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Measured(_) => write!(fmt, "{} msec", self.as_millis()),
            _ => fmt.write_str("unavailable"),
        }
    }
}

/// An observer of proxy activity.
///
/// `after_comm` and `after_conn` are called from a dedicated dispatch
/// thread, never from the connection's own tasks, so a slow hook delays
/// other hooks but not the traffic.
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Called once before the first connection is accepted
    fn after_init(&self) {}

    fn after_comm(&self, _event: &CommEvent) {}

    fn after_conn(&self, _event: &ConnEvent) {}
}

/// A hook that additionally decides the fate of each message
pub trait FilterHook: Hook {
    /// Called with the complete message once the client has sent it and
    /// before any of it reaches the destination. This is invoked on a
    /// blocking thread and may take its time.
    fn before_relay(&self, request: &FilterRequest) -> FilterDecision;
}

/// A hook as registered with the server
#[derive(Clone)]
pub enum RegisteredHook {
    Observer(Arc<dyn Hook>),
    Filter(Arc<dyn FilterHook>),
}

impl RegisteredHook {
    pub fn observer(hook: impl Hook + 'static) -> Self {
        Self::Observer(Arc::new(hook))
    }

    pub fn filter(hook: impl FilterHook + 'static) -> Self {
        Self::Filter(Arc::new(hook))
    }

    pub fn as_filter(&self) -> Option<Arc<dyn FilterHook>> {
        match self {
            Self::Observer(_) => None,
            Self::Filter(filter) => Some(Arc::clone(filter)),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Observer(hook) => hook.name(),
            Self::Filter(hook) => hook.name(),
        }
    }

    pub fn after_init(&self) {
        match self {
            Self::Observer(hook) => hook.after_init(),
            Self::Filter(hook) => hook.after_init(),
        }
    }

    pub fn after_comm(&self, event: &CommEvent) {
        match self {
            Self::Observer(hook) => hook.after_comm(event),
            Self::Filter(hook) => hook.after_comm(event),
        }
    }

    pub fn after_conn(&self, event: &ConnEvent) {
        match self {
            Self::Observer(hook) => hook.after_conn(event),
            Self::Filter(hook) => hook.after_conn(event),
        }
    }
}

impl std::fmt::Debug for RegisteredHook {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Observer(hook) => write!(fmt, "Observer({})", hook.name()),
            Self::Filter(hook) => write!(fmt, "Filter({})", hook.name()),
        }
    }
}
