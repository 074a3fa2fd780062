use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWrite};

/// A byte stream the pipe can own: a plain socket, a TLS-wrapped
/// socket, or an in-memory stream in tests.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Debug + Unpin + Send {}
impl<T> AsyncReadAndWrite for T where T: AsyncRead + AsyncWrite + Debug + Unpin + Send {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;
