//! Frame-level WebSocket transport ([RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455)).
//!
//! The crate is built around [`Conn`], a bidirectional message-oriented
//! endpoint over a reliable byte stream. Unlike message-buffer APIs, the
//! send and receive paths are cursor-based: a frame is started with its
//! length (or in stream mode, without one), its payload is written or read
//! in as many calls as the caller likes, and the frame is terminated
//! explicitly. Control frames (ping/pong/close) are interleaved on the
//! shared stream under a write lock, so a background keepalive ping can
//! land between the fragments of a long-lived stream without the sender
//! cooperating.
//!
//! Connections are created by the client-side handshake ([`Conn::connect`],
//! [`Conn::handshake`]) or the server-side upgrade ([`Conn::upgrade`]).
//!
//! ```no_run
//! use wsframe::{Conn, FrameKind, Options};
//!
//! async fn run() -> wsframe::Result<()> {
//!     let (conn, handshake) = Conn::connect(
//!         "wss://example.com/feed".parse()?,
//!         Options::default().with_protocol("apple"),
//!     )
//!     .await?;
//!     log::info!("negotiated subprotocol: {:?}", handshake.protocol);
//!
//!     conn.send_text("hello").await?;
//!     let mut buf = [0u8; 4096];
//!     loop {
//!         match conn.next_frame().await? {
//!             FrameKind::Text | FrameKind::Binary => {
//!                 while conn.read(&mut buf).await? > 0 {}
//!             }
//!             FrameKind::Pong => {}
//!         }
//!     }
//! }
//! ```

mod conn;
pub mod frame;
mod handshake;
mod mask;
mod stream;

use thiserror::Error;

pub use conn::Conn;
pub use frame::{CloseReason, FrameKind, OpCode};
pub use handshake::{Handshake, HttpResponse, Options, UpgradeFut};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The variants fall into a few broad groups:
///
/// - Protocol errors (peer misbehavior): invalid opcodes, stray
///   continuations, oversized control frames, pong sequencing violations.
///   The connection should be force-closed after one of these.
/// - Contract errors (local misuse): oversize writes, incomplete frames at
///   `end`, reading outside a frame. These leave the connection in a state
///   that only [`Conn::force_close`] can resolve.
/// - Terminal conditions: [`AlreadyClosed`](WebSocketError::AlreadyClosed),
///   [`ConnectionClosed`](WebSocketError::ConnectionClosed),
///   [`ClosedByPeer`](WebSocketError::ClosedByPeer).
/// - Handshake failures.
/// - Wrapped I/O, HTTP, URL and JSON errors.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Returned by send operations once the connection has ended.
    /// A write error is remapped to this variant when the closed-notifier
    /// has already fired.
    #[error("write after connection already closed")]
    AlreadyClosed,

    /// The connection has ended and no further frames will arrive. This is
    /// the normal terminal condition on the receive path after a close
    /// handshake this side initiated, or after a forced close.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The peer initiated the close handshake. Carries the peer's status
    /// code and reason text.
    #[error("closed: {0}")]
    ClosedByPeer(CloseReason),

    /// A graceful [`Conn::close`] did not complete within its deadline.
    /// The connection has been force-closed.
    #[error("close timed out")]
    CloseTimeout,

    /// Receipt of a frame with an opcode outside the set defined by
    /// RFC 6455 section 11.8.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Reserved header bits were set. No extension negotiates them here,
    /// so they must be zero.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A continuation frame arrived with no preceding non-final frame.
    #[error("continuation frame without a starting frame")]
    UnexpectedContinuation,

    /// A fragmented message was interrupted by a data frame that is not a
    /// continuation.
    #[error("expected continuation frame but got opcode {0}")]
    ExpectedContinuation(u8),

    /// A control frame (close, ping, pong) arrived with the FIN bit clear.
    /// RFC 6455 forbids fragmenting control frames.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// An incoming ping was too large to echo (greater than 64 KiB), or an
    /// outgoing ping exceeded the 125-byte control-frame limit.
    #[error("ping frame too large")]
    PingFrameTooLarge,

    /// An incoming pong exceeded the 125-byte control-frame limit.
    #[error("pong frame too large")]
    PongFrameTooLarge,

    /// A pong payload did not parse as a decimal keepalive sequence number.
    #[error("malformed pong payload")]
    MalformedPong,

    /// A pong carried a sequence number other than the one the keepalive
    /// loop is waiting for.
    #[error("pong out of sequence (expected {expected} but got {got})")]
    PongOutOfSequence {
        /// The sequence number the next pong was required to carry.
        expected: u32,
        /// The sequence number the peer actually sent.
        got: u32,
    },

    /// A close frame carried a payload larger than the 125-byte
    /// control-frame limit.
    #[error("oversized close frame")]
    OversizedCloseFrame,

    /// More payload bytes were written than the frame declared. The write
    /// lock remains held; the connection is corrupt and should be
    /// force-closed.
    #[error("oversize write")]
    OversizeWrite,

    /// [`Conn::end`] was called before the declared payload length was
    /// written. The write lock remains held.
    #[error("incomplete frame write")]
    IncompleteFrameWrite,

    /// A payload operation was attempted with no frame started.
    #[error("no frame in progress")]
    NoFrameInProgress,

    /// [`Conn::next_frame`] was called before the previous frame's payload
    /// was drained or while the previous message was unterminated.
    #[error("previous frame not fully read")]
    PreviousFrameUnread,

    /// The server answered the upgrade request with an unexpected HTTP
    /// status.
    #[error("unexpected http status {0}")]
    InvalidStatusCode(u16),

    /// The server rejected our protocol version and advertised the
    /// versions it supports.
    #[error("client supports version 13 (server supports: {0})")]
    UnsupportedVersion(String),

    /// The handshake was answered with 405, or an upgrade request used a
    /// method other than GET.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// The HTTP "Upgrade" header is missing or does not name "websocket".
    #[error("invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The HTTP "Connection" header is missing or does not name "upgrade".
    #[error("invalid connection header")]
    InvalidConnectionHeader,

    /// The server's `Sec-WebSocket-Accept` does not match the transform of
    /// the key we sent.
    #[error("bad challenge response")]
    InvalidAcceptKey,

    /// An upgrade request arrived without `Sec-WebSocket-Key`.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The `Sec-WebSocket-Version` header is not 13.
    #[error("Sec-WebSocket-Version must be 13")]
    InvalidSecWebSocketVersion,

    /// The server selected a subprotocol this client never offered.
    #[error("unsupported websocket protocol {0:?}")]
    UnsupportedSubprotocol(String),

    /// A subprotocol name offered locally contains characters outside
    /// `[A-Za-z]`.
    #[error("invalid character in protocol {0:?}")]
    InvalidSubprotocolName(String),

    /// A dial URL used a scheme other than "ws" or "wss".
    #[error("invalid http scheme")]
    InvalidHttpScheme,

    /// Wraps errors from URL parsing.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps standard I/O errors from the underlying byte stream.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Wraps errors from hyper during the handshake or upgrade.
    #[error(transparent)]
    HTTPError(#[from] hyper::Error),

    /// Wraps JSON encode/decode errors from `send_json`/`read_json`.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
