//! The WebSocket connection: cursor-based send/receive paths over a
//! shared byte stream, the close handshake and the keepalive loop.

use std::{
    future::Future,
    io,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use bytes::{Buf, Bytes};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    sync::{Mutex, MutexGuard, OwnedMutexGuard},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{
    frame::{CloseReason, FrameKind, Header, OpCode, MAX_HEADER_SIZE},
    handshake::Options,
    mask,
    stream::BoxStream,
    Result, WebSocketError,
};

/// Ping cadence used when the handshake options leave the interval at
/// zero.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Incoming pings above the 125-byte control limit are echoed anyway, but
/// beyond this the peer is clearly hostile and the connection is
/// terminated.
const MAX_LENIENT_PING: u64 = 65536;

/// Pending frame bytes are coalesced up to this size before being pushed
/// to the socket.
const WRITE_BUFFER_SIZE: usize = 8 * 1024;

/// A WebSocket connection.
///
/// At most one data send may be in progress at a time, at most one control
/// send, and at most one data receive; a second concurrent caller on the
/// same path panics rather than queueing, because queueing would reorder
/// frame bytes silently. A forced close is legal from any task at any
/// time. Incoming pings are answered during calls to
/// [`next_frame`](Conn::next_frame).
///
/// All methods take `&self`; share the connection between tasks with
/// [`Arc`] to read and write concurrently.
pub struct Conn {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").finish_non_exhaustive()
    }
}

struct Inner {
    /// Write lock: held by any producer of bytes from the first header
    /// byte of a frame through the last payload byte. FIFO-ish.
    wire: Arc<Mutex<Wire>>,

    /// Data-send detector plus the send-side cursor.
    send: Cad<SendState>,

    /// Control-send detector, used by the keepalive loop.
    control: Cad<()>,

    /// Data-receive detector plus the receive-side cursor.
    recv: Cad<RecvState>,

    /// Fans out "the connection has ended" to every waiter.
    closed: CancellationToken,

    /// Highest keepalive sequence number confirmed by the peer.
    last_pong: AtomicU32,

    /// The socket write half, shared with the wire so a forced close can
    /// always shut the stream down, frame lock or no frame lock.
    socket: Arc<Mutex<WriteHalf<BoxStream>>>,

    /// Close payload recorded when the peer closed first.
    peer_close: StdMutex<Option<CloseReason>>,

    /// Keepalive task handle, joined during a forced close.
    keepalive: StdMutex<Option<JoinHandle<()>>>,

    /// Surface pong frames from `next_frame` instead of consuming them.
    observe_pongs: bool,
}

/// Frame-producing state guarded by the write lock: the write-coalescing
/// buffer and the close flag.
///
/// The socket write half deliberately sits behind its own lock, taken
/// only across individual socket calls, never across a whole frame. A
/// forced close must be able to shut the stream down while a corrupt
/// sender keeps the frame lock forever, so the frame lock must never be
/// the sole route to the socket.
struct Wire {
    /// Frame bytes accepted but not yet pushed to the socket.
    pending: Vec<u8>,
    /// The socket write half, shared with `Inner::shutdown`.
    socket: Arc<Mutex<WriteHalf<BoxStream>>>,
    closed: CancellationToken,
    /// Set once a close frame has gone out, locally or as an echo.
    close_sent: bool,
}

impl Wire {
    /// Stages an encoded frame header in the pending buffer.
    fn push_header(&mut self, header: &Header) {
        let mut head = [0u8; MAX_HEADER_SIZE];
        let size = header.encode(&mut head);
        self.pending.extend_from_slice(&head[..size]);
    }

    /// Stages payload bytes, spilling to the socket when the coalescing
    /// buffer fills up.
    async fn push(&mut self, data: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(data);
        if self.pending.len() >= WRITE_BUFFER_SIZE {
            self.write_pending().await?;
        }
        Ok(())
    }

    async fn write_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut socket = lock_socket(&self.closed, &self.socket).await?;
        write_io(&self.closed, socket.write_all(&self.pending)).await?;
        drop(socket);
        self.pending.clear();
        Ok(())
    }

    /// Pushes everything staged onto the socket and flushes it.
    async fn flush(&mut self) -> Result<()> {
        self.write_pending().await?;
        let mut socket = lock_socket(&self.closed, &self.socket).await?;
        write_io(&self.closed, socket.flush()).await
    }
}

/// Send-side cursor, guarded by the data-send detector.
struct SendState {
    /// Remaining payload bytes of the current fixed-length frame.
    remaining: u64,
    /// Stream mode: each write becomes its own continuation fragment.
    streaming: bool,
    /// The write lock, held from `start_*` until a successful `end` for
    /// fixed-length frames.
    wire: Option<OwnedMutexGuard<Wire>>,
}

/// Receive-side cursor, guarded by the data-receive detector.
struct RecvState {
    r: BufReader<ReadHalf<BoxStream>>,
    /// Remaining payload bytes of the fragment being read.
    remaining: u64,
    /// Header of the fragment being read.
    frame: Header,
    /// Mask phase within the current fragment, carried across reads.
    mask_pos: usize,
    /// Whether any data frame has been received yet.
    primed: bool,
    /// Surfaced pong payload, served by `read` ahead of the wire.
    inline: Option<Bytes>,
}

impl RecvState {
    fn new(r: BufReader<ReadHalf<BoxStream>>) -> Self {
        Self {
            r,
            remaining: 0,
            frame: Header::default(),
            mask_pos: 0,
            primed: false,
            inline: None,
        }
    }

    fn begin(&mut self, frame: Header) {
        self.remaining = frame.length;
        self.frame = frame;
        self.mask_pos = 0;
        self.primed = true;
    }
}

/// Concurrent access detector.
///
/// Holds the state of one path (send, control or receive) and hands it out
/// only when nobody else has it. Contention means two tasks are in the
/// same path at once, which is a programmer error that cannot be repaired
/// at runtime, so it panics.
struct Cad<T> {
    name: &'static str,
    slot: Mutex<T>,
}

impl<T> Cad<T> {
    fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            slot: Mutex::new(value),
        }
    }

    fn acquire(&self) -> MutexGuard<'_, T> {
        self.slot
            .try_lock()
            .unwrap_or_else(|_| panic!("concurrent {} access", self.name))
    }
}

/// Runs a write-side I/O step, failing fast once the closed-notifier has
/// fired and remapping late write errors to `AlreadyClosed`.
async fn write_io<T>(
    closed: &CancellationToken,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = closed.cancelled() => Err(WebSocketError::AlreadyClosed),
        res = fut => match res {
            Ok(value) => Ok(value),
            Err(_) if closed.is_cancelled() => Err(WebSocketError::AlreadyClosed),
            Err(err) => Err(err.into()),
        },
    }
}

/// Locks the socket write half, giving up once the connection has ended.
/// Socket holders only await under token-guarded selects, so after a
/// cancel this resolves promptly instead of queueing forever.
async fn lock_socket<'a>(
    closed: &CancellationToken,
    socket: &'a Mutex<WriteHalf<BoxStream>>,
) -> Result<MutexGuard<'a, WriteHalf<BoxStream>>> {
    tokio::select! {
        biased;
        _ = closed.cancelled() => Err(WebSocketError::AlreadyClosed),
        guard = socket.lock() => Ok(guard),
    }
}

/// Runs a read-side step; once the connection has ended the receive path
/// uniformly reports end-of-stream.
async fn read_io<T>(
    closed: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = closed.cancelled() => Err(WebSocketError::ConnectionClosed),
        res = fut => match res {
            Err(WebSocketError::IoError(_)) if closed.is_cancelled() => {
                Err(WebSocketError::ConnectionClosed)
            }
            other => other,
        },
    }
}

impl Inner {
    /// Acquires the write lock, bailing out if the connection ends while
    /// waiting. Without this a caller could block forever behind a lock
    /// that a corrupt sender will never release.
    async fn lock_wire(&self) -> Result<MutexGuard<'_, Wire>> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(WebSocketError::AlreadyClosed),
            wire = self.wire.lock() => Ok(wire),
        }
    }

    /// Fires the closed-notifier and shuts the byte stream down.
    /// Idempotent. Reaches the socket through its own lock rather than
    /// the frame lock, which a corrupt sender may hold forever; anyone
    /// mid-socket-call observes the notifier and releases promptly.
    async fn shutdown(&self) {
        self.closed.cancel();
        let mut socket = self.socket.lock().await;
        let _ = socket.shutdown().await;
    }

    /// Sends a ping through the control slot. May run concurrently with a
    /// data send; the write lock serializes the bytes at a frame boundary.
    async fn ping(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > 125 {
            return Err(WebSocketError::PingFrameTooLarge);
        }

        let _slot = self.control.acquire();
        if self.closed.is_cancelled() {
            return Err(WebSocketError::AlreadyClosed);
        }

        let mut wire = self.lock_wire().await?;
        wire.push_header(&Header::control(OpCode::Ping, payload.len() as u64));
        wire.push(payload).await?;
        wire.flush().await
    }
}

impl Conn {
    /// Builds a connection over an already-established byte stream.
    ///
    /// This is the entry point for transports the crate does not dial
    /// itself, such as a hijacked server connection; [`Conn::connect`],
    /// [`Conn::handshake`] and [`Conn::upgrade`] all end up here. The
    /// keepalive loop starts immediately with the cadence from `options`.
    pub fn from_stream<S>(io: S, options: &Options) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(Box::new(io) as BoxStream);
        let closed = CancellationToken::new();
        let socket = Arc::new(Mutex::new(writer));

        let inner = Arc::new(Inner {
            wire: Arc::new(Mutex::new(Wire {
                pending: Vec::with_capacity(1024),
                socket: Arc::clone(&socket),
                closed: closed.clone(),
                close_sent: false,
            })),
            send: Cad::new(
                "write",
                SendState {
                    remaining: 0,
                    streaming: false,
                    wire: None,
                },
            ),
            control: Cad::new("control", ()),
            recv: Cad::new("read", RecvState::new(BufReader::new(reader))),
            socket,
            closed,
            last_pong: AtomicU32::new(0),
            peer_close: StdMutex::new(None),
            keepalive: StdMutex::new(None),
            observe_pongs: options.observe_pongs,
        });

        let task = tokio::spawn(keepalive_loop(
            Arc::clone(&inner),
            options.ping_interval,
            options.pong_timeout,
        ));
        *inner.keepalive.lock().expect("keepalive handle") = Some(task);

        Self { inner }
    }

    // ================== send path ====================

    /// Starts a text frame of the given payload length.
    ///
    /// Acquires the write lock; it is released by a successful
    /// [`end`](Conn::end). Exactly `length` bytes must be written before
    /// `end`.
    pub async fn start_text(&self, length: u64) -> Result<()> {
        self.start_data(OpCode::Text, length).await
    }

    /// Starts a binary frame of the given payload length.
    pub async fn start_binary(&self, length: u64) -> Result<()> {
        self.start_data(OpCode::Binary, length).await
    }

    /// Starts a streamed text message. Each subsequent
    /// [`write`](Conn::write) goes out as its own continuation fragment,
    /// so the total length never needs to be declared up front.
    pub async fn start_text_stream(&self) -> Result<()> {
        self.start_stream(OpCode::Text).await
    }

    /// Starts a streamed binary message.
    pub async fn start_binary_stream(&self) -> Result<()> {
        self.start_stream(OpCode::Binary).await
    }

    async fn start_data(&self, opcode: OpCode, length: u64) -> Result<()> {
        let mut send = self.inner.send.acquire();
        if self.inner.closed.is_cancelled() {
            return Err(WebSocketError::AlreadyClosed);
        }
        if send.streaming || send.wire.is_some() {
            return Err(WebSocketError::IncompleteFrameWrite);
        }

        let wire = self.start_frame(Header::data(opcode, length)).await?;
        send.remaining = length;
        send.streaming = false;
        send.wire = Some(wire);
        Ok(())
    }

    async fn start_stream(&self, opcode: OpCode) -> Result<()> {
        let mut send = self.inner.send.acquire();
        if self.inner.closed.is_cancelled() {
            return Err(WebSocketError::AlreadyClosed);
        }
        if send.streaming || send.wire.is_some() {
            return Err(WebSocketError::IncompleteFrameWrite);
        }

        // the opening header is a complete zero-length fragment, so the
        // write lock is released right away at the frame boundary
        let wire = self.start_frame(Header::stream_open(opcode)).await?;
        drop(wire);

        send.remaining = 0;
        send.streaming = true;
        Ok(())
    }

    /// Takes the write lock and stages a frame header.
    async fn start_frame(&self, header: Header) -> Result<OwnedMutexGuard<Wire>> {
        let mut wire = tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => return Err(WebSocketError::AlreadyClosed),
            wire = Arc::clone(&self.inner.wire).lock_owned() => wire,
        };

        wire.push_header(&header);
        Ok(wire)
    }

    /// Writes payload bytes into the current frame or stream.
    ///
    /// In a fixed-length frame, writing more than the declared length
    /// fails with [`WebSocketError::OversizeWrite`] and the write lock
    /// stays held: the wire is corrupt and the caller should
    /// [`force_close`](Conn::force_close). In stream mode the bytes go out
    /// as one non-final continuation fragment.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut send = self.inner.send.acquire();
        let send = &mut *send;

        if send.streaming {
            let mut wire = self.inner.lock_wire().await?;
            wire.push_header(&Header::continuation(false, data.len() as u64));
            return wire.push(data).await;
        }

        let Some(wire) = send.wire.as_mut() else {
            return Err(WebSocketError::NoFrameInProgress);
        };
        if (data.len() as u64) > send.remaining {
            return Err(WebSocketError::OversizeWrite);
        }

        wire.push(data).await?;
        send.remaining -= data.len() as u64;
        Ok(())
    }

    /// Ends the current frame or stream and flushes.
    ///
    /// A fixed-length frame must have had its declared length written
    /// exactly; otherwise [`WebSocketError::IncompleteFrameWrite`] is
    /// returned and the write lock stays held. A stream is terminated with
    /// an empty final continuation fragment.
    pub async fn end(&self) -> Result<()> {
        let mut send = self.inner.send.acquire();
        let send = &mut *send;

        if send.streaming {
            let mut wire = self.inner.lock_wire().await?;
            wire.push_header(&Header::continuation(true, 0));
            wire.flush().await?;
            send.streaming = false;
            return Ok(());
        }

        let Some(wire) = send.wire.as_mut() else {
            return Err(WebSocketError::NoFrameInProgress);
        };
        if send.remaining != 0 {
            return Err(WebSocketError::IncompleteFrameWrite);
        }

        wire.flush().await?;
        send.wire = None;
        Ok(())
    }

    /// Sends a text frame with the given string.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.start_text(text.len() as u64).await?;
        self.write(text.as_bytes()).await?;
        self.end().await
    }

    /// Sends a binary frame with the given data.
    pub async fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.start_binary(data.len() as u64).await?;
        self.write(data).await?;
        self.end().await
    }

    /// Serializes `value` as JSON and sends it as a streamed text message,
    /// sparing the caller from sizing the message up front.
    pub async fn send_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.start_text_stream().await?;
        self.write(&data).await?;
        self.end().await
    }

    // ================== receive path ====================

    /// Reads headers until the next message-bearing frame and returns its
    /// type, positioning the receive cursor over its payload.
    ///
    /// Pings are answered transparently. Pongs feed the keepalive counter
    /// and are consumed, unless the connection was configured with
    /// [`Options::with_observed_pongs`], in which case they surface as
    /// [`FrameKind::Pong`] with the payload readable like any other frame.
    ///
    /// It is an error to call this while the previous frame's payload is
    /// not drained or the previous message is unterminated.
    ///
    /// # Errors
    /// - [`WebSocketError::ClosedByPeer`] when the peer initiates the
    ///   close handshake; the close frame has been echoed and the
    ///   connection force-closed.
    /// - [`WebSocketError::ConnectionClosed`] when this side initiated the
    ///   close and the peer's echo arrived, or after a forced close.
    /// - Protocol errors for stray continuations, unknown opcodes,
    ///   oversized control frames and pong sequencing violations; the
    ///   caller should force-close.
    pub async fn next_frame(&self) -> Result<FrameKind> {
        let mut recv = self.inner.recv.acquire();

        if self.inner.closed.is_cancelled() {
            return Err(WebSocketError::ConnectionClosed);
        }
        if recv.remaining > 0 || recv.inline.is_some() || (!recv.frame.fin && recv.primed) {
            return Err(WebSocketError::PreviousFrameUnread);
        }

        loop {
            let header = read_io(&self.inner.closed, Header::read_from(&mut recv.r)).await?;
            if !header.rsv_clear() {
                return Err(WebSocketError::ReservedBitsNotZero);
            }

            match header.opcode {
                OpCode::Text => {
                    recv.begin(header);
                    return Ok(FrameKind::Text);
                }
                OpCode::Binary => {
                    recv.begin(header);
                    return Ok(FrameKind::Binary);
                }
                OpCode::Continuation => {
                    return Err(WebSocketError::UnexpectedContinuation);
                }
                OpCode::Pong => {
                    if !header.fin {
                        return Err(WebSocketError::ControlFrameFragmented);
                    }
                    if header.length > 125 {
                        return Err(WebSocketError::PongFrameTooLarge);
                    }
                    let payload = self.read_control_payload(&mut recv, &header).await?;

                    if self.inner.observe_pongs {
                        // still advance the keepalive counter when the
                        // payload happens to carry the expected sequence
                        if let Some(n) = parse_pong(&payload) {
                            let _ = self.inner.last_pong.compare_exchange(
                                n.wrapping_sub(1),
                                n,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                        }
                        recv.frame = header;
                        recv.inline = Some(Bytes::from(payload));
                        return Ok(FrameKind::Pong);
                    }

                    let n = parse_pong(&payload).ok_or(WebSocketError::MalformedPong)?;
                    if self
                        .inner
                        .last_pong
                        .compare_exchange(n.wrapping_sub(1), n, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return Err(WebSocketError::PongOutOfSequence {
                            expected: self.inner.last_pong.load(Ordering::Acquire) + 1,
                            got: n,
                        });
                    }
                }
                OpCode::Ping => {
                    if !header.fin {
                        return Err(WebSocketError::ControlFrameFragmented);
                    }
                    // the length is supposed to be at most 125; rather
                    // than kill the connection we tolerate longer pings,
                    // up to a point
                    if header.length > MAX_LENIENT_PING {
                        self.force_close().await;
                        return Err(WebSocketError::PingFrameTooLarge);
                    }
                    let payload = self.read_control_payload(&mut recv, &header).await?;
                    self.send_pong(&payload).await?;
                }
                OpCode::Close => {
                    if !header.fin {
                        return Err(WebSocketError::ControlFrameFragmented);
                    }
                    if header.length > 125 {
                        self.force_close().await;
                        return Err(WebSocketError::OversizedCloseFrame);
                    }
                    let payload = self.read_control_payload(&mut recv, &header).await?;
                    return self.on_close(payload).await;
                }
            }
        }
    }

    /// Reads (and unmasks) the payload of a control frame.
    async fn read_control_payload(
        &self,
        recv: &mut RecvState,
        header: &Header,
    ) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; header.length as usize];
        read_io(&self.inner.closed, async {
            recv.r.read_exact(&mut payload).await?;
            Ok(())
        })
        .await?;
        if let Some(key) = header.mask {
            mask::apply_mask(&mut payload, key);
        }
        Ok(payload)
    }

    /// Answers a ping. Locks the wire directly rather than through the
    /// control slot, so it cannot collide with the keepalive detector.
    async fn send_pong(&self, payload: &[u8]) -> Result<()> {
        let mut wire = self.inner.lock_wire().await?;
        wire.push_header(&Header::control(OpCode::Pong, payload.len() as u64));
        wire.push(payload).await?;
        wire.flush().await
    }

    /// The close-receive protocol: echo the close unless we initiated,
    /// record the peer's reason, then force-close.
    async fn on_close(&self, payload: Vec<u8>) -> Result<FrameKind> {
        let initiated_by_peer = {
            let mut wire = self.inner.lock_wire().await?;
            let initiated_by_peer = !wire.close_sent;
            if initiated_by_peer {
                wire.push_header(&Header::control(OpCode::Close, payload.len() as u64));
                wire.push(&payload).await?;
                wire.flush().await?;
                wire.close_sent = true;
            }
            initiated_by_peer
        };

        if initiated_by_peer {
            let reason = CloseReason::new(payload);
            *self.inner.peer_close.lock().expect("close reason") = Some(reason.clone());
            self.force_close().await;
            return Err(WebSocketError::ClosedByPeer(reason));
        }

        // we initiated; the peer's echo completes the handshake
        self.force_close().await;
        Err(WebSocketError::ConnectionClosed)
    }

    /// Reads payload bytes of the current frame into `buf`, returning the
    /// number of bytes read, or `0` at the end of the message.
    ///
    /// When a non-final fragment is exhausted the cursor advances over the
    /// next continuation header transparently. Masked payloads are
    /// unmasked with the key phase carried across calls.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut recv = self.inner.recv.acquire();

        // surfaced pong payloads are served ahead of the wire
        if let Some(payload) = recv.inline.as_mut() {
            if payload.is_empty() {
                recv.inline = None;
                return Ok(0);
            }
            let n = payload.len().min(buf.len());
            buf[..n].copy_from_slice(&payload[..n]);
            payload.advance(n);
            return Ok(n);
        }

        if !recv.primed {
            return Err(WebSocketError::NoFrameInProgress);
        }

        loop {
            if recv.remaining == 0 {
                if recv.frame.fin {
                    return Ok(0);
                }
                let header = read_io(&self.inner.closed, Header::read_from(&mut recv.r)).await?;
                if !header.rsv_clear() {
                    return Err(WebSocketError::ReservedBitsNotZero);
                }
                if header.opcode != OpCode::Continuation {
                    return Err(WebSocketError::ExpectedContinuation(u8::from(header.opcode)));
                }
                recv.begin(header);
                continue;
            }

            if buf.is_empty() {
                return Ok(0);
            }

            let want = recv.remaining.min(buf.len() as u64) as usize;
            let n = {
                let r = &mut recv.r;
                read_io(&self.inner.closed, async { Ok(r.read(&mut buf[..want]).await?) }).await?
            };
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }

            if let Some(key) = recv.frame.mask {
                mask::apply_mask_offset(&mut buf[..n], key, recv.mask_pos);
            }
            recv.mask_pos += n;
            recv.remaining -= n as u64;
            return Ok(n);
        }
    }

    /// Reads the entire current message and decodes it as JSON.
    pub async fn read_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..n]);
        }
        Ok(serde_json::from_slice(&data)?)
    }

    // ================== closure ====================

    /// Attempts to gracefully close the connection.
    ///
    /// Sends a close frame with the given status code and reason (reasons
    /// longer than 123 bytes are truncated with a trailing ellipsis so the
    /// payload fits the control-frame limit), then waits for the peer's
    /// echo or the timeout. The echo is observed by whichever task is in
    /// [`next_frame`](Conn::next_frame), so a connection that wants a
    /// graceful close needs a concurrent reader.
    ///
    /// On timeout the connection is force-closed and
    /// [`WebSocketError::CloseTimeout`] is returned.
    pub async fn close(&self, timeout: Duration, code: u16, reason: &str) -> Result<()> {
        let _send = self.inner.send.acquire();
        if self.inner.closed.is_cancelled() {
            return Err(WebSocketError::AlreadyClosed);
        }

        {
            let mut wire = self.inner.lock_wire().await?;
            let payload = close_payload(code, reason);
            wire.push_header(&Header::control(OpCode::Close, payload.len() as u64));
            wire.push(&payload).await?;
            wire.flush().await?;
            wire.close_sent = true;
        }

        tokio::select! {
            _ = self.inner.closed.cancelled() => Ok(()),
            _ = time::sleep(timeout) => {
                self.force_close().await;
                Err(WebSocketError::CloseTimeout)
            }
        }
    }

    /// Terminates the connection immediately.
    ///
    /// Fires the closed-notifier (idempotent), shuts the byte stream
    /// down, and joins the keepalive task. The socket is reached outside
    /// the frame lock, so the stream goes down even while a corrupt
    /// sender still holds that lock. Any in-flight operation observes the
    /// notifier and returns [`WebSocketError::AlreadyClosed`] or
    /// [`WebSocketError::ConnectionClosed`].
    pub async fn force_close(&self) {
        self.inner.shutdown().await;

        let task = self.inner.keepalive.lock().expect("keepalive handle").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// The close payload recorded if the peer initiated the close
    /// handshake.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.peer_close.lock().expect("close reason").clone()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.inner.closed.cancel();
        if let Some(task) = self.inner.keepalive.lock().expect("keepalive handle").take() {
            task.abort();
        }
    }
}

/// Builds a close payload: two status-code bytes then the reason,
/// truncated at a character boundary so the whole payload fits in 125
/// bytes; a truncated reason ends with "...".
fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len().min(123));
    payload.extend_from_slice(&code.to_be_bytes());

    if reason.len() + 2 > 125 {
        let mut cut = 120;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        payload.extend_from_slice(reason[..cut].as_bytes());
        payload.extend_from_slice(b"...");
    } else {
        payload.extend_from_slice(reason.as_bytes());
    }
    payload
}

fn parse_pong(payload: &[u8]) -> Option<u32> {
    std::str::from_utf8(payload).ok()?.parse().ok()
}

/// The keepalive loop: pings the peer on a fixed cadence with an
/// incrementing decimal sequence number and force-closes the connection
/// when `ceil(pong_timeout / interval)` consecutive ticks pass without the
/// matching pong.
///
/// The numbered payload is what lets this task stay decoupled from the
/// receive path: the pong handler in `next_frame` advances `last_pong`
/// with a compare-and-swap, and this loop only ever reads it.
async fn keepalive_loop(inner: Arc<Inner>, interval: Duration, pong_timeout: Duration) {
    let interval = if interval.is_zero() {
        DEFAULT_PING_INTERVAL
    } else {
        interval
    };
    let pong_timeout = if pong_timeout.is_zero() {
        2 * interval
    } else {
        pong_timeout
    };

    let strikes = pong_timeout
        .as_nanos()
        .div_ceil(interval.as_nanos())
        .max(1) as u32;

    let mut tick = time::interval_at(time::Instant::now() + interval, interval);
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    let mut last_ping: u32 = 0;
    let mut remaining = strikes;

    loop {
        tokio::select! {
            biased;
            _ = inner.closed.cancelled() => return,
            _ = tick.tick() => {}
        }

        if inner.last_pong.load(Ordering::Acquire) < last_ping {
            remaining -= 1;
            if remaining == 0 {
                log::debug!("keepalive: no pong within {pong_timeout:?}, closing connection");
                inner.shutdown().await;
                return;
            }
        } else {
            remaining = strikes;
            last_ping += 1;
            if let Err(err) = inner.ping(last_ping.to_string().as_bytes()).await {
                log::debug!("keepalive: ping failed: {err}");
                inner.shutdown().await;
                return;
            }
        }
    }
}
