//! The byte-stream abstraction under a connection.
//!
//! After the handshake a connection owns its transport as an erased
//! [`BoxStream`], so one connection type serves TCP, TLS and hyper's
//! upgraded streams alike. The dialer hands each concrete stream type to
//! the handshake directly; nothing is wrapped until the connection takes
//! ownership.

use tokio::io::{AsyncRead, AsyncWrite};

/// The stream types a connection can be built over: anything that is a
/// reliable, bidirectional byte stream.
pub(crate) trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// The erased stream a connection owns after the handshake.
pub(crate) type BoxStream = Box<dyn ByteStream>;
