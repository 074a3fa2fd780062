//! Transparent SMTP interception proxy.
//!
//! A [`pipe::ConnectionPipe`] sits between an SMTP client and the server the
//! client was trying to reach. The client-facing leg stays in the clear while
//! the destination leg is upgraded to TLS behind the client's back: the
//! STARTTLS capability is stripped from the EHLO response the client sees and
//! the proxy negotiates STARTTLS with the destination on its own.
//!
//! Along the way envelope metadata is captured, DATA-phase content can be
//! inspected and altered by [`hook::FilterHook`] implementations and every
//! unit of traffic is reported to [`hook::Hook`] observers.
pub mod address;
pub mod conn_id;
pub mod data_phase;
pub mod dialer;
pub mod dispatch;
pub mod filter;
pub mod hook;
pub mod pipe;
pub mod port_range;
pub mod resolver;
pub mod response;
pub mod server;
pub mod starttls;
pub mod tls;
pub mod traits;

pub use dialer::Dialer;
pub use filter::{FilterDecision, FilterRequest};
pub use hook::{CommEvent, ConnEvent, Direction, Elapse, FilterHook, Hook, RegisteredHook};
pub use pipe::{ConnectionInfo, ConnectionPipe, Mediator, PipeConfig, PipeError, PipeHooks};
pub use port_range::PortRange;
pub use resolver::{DestinationResolver, FixedDestination, OriginalDestination};
pub use server::{Server, ServerConfig};
pub use traits::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
