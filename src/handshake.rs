//! The opening handshake: the client-side HTTP/1.1 upgrade request and
//! the server-side upgrade answer
//! ([RFC 6455 Section 4](https://datatracker.ietf.org/doc/html/rfc6455#section-4)).

use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{
    body::Incoming,
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::{
    rustls::{self, pki_types::ServerName},
    TlsConnector,
};
use url::Url;

use crate::{Conn, Result, WebSocketError};

/// The HTTP response a server-side upgrade produces. It must be sent back
/// to the client before the paired [`UpgradeFut`] will resolve.
pub type HttpResponse = Response<Empty<Bytes>>;

/// Configuration recognized by the handshake, plus the keepalive cadence
/// of the resulting connection.
///
/// ```
/// use std::time::Duration;
/// use wsframe::Options;
///
/// let options = Options::default()
///     .with_protocol("apple")
///     .with_protocol("orange")
///     .with_ping_interval(Duration::from_secs(10));
/// ```
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Subprotocol names to offer (client) or accept (server), in
    /// preference order. Names must match `[A-Za-z]+`; anything else is
    /// rejected locally before a request goes out.
    pub supported_protocols: Vec<String>,

    /// Additional request headers for the client handshake. These form
    /// the base of the request; the WebSocket-specific headers are always
    /// set on top.
    pub headers: Option<HeaderMap>,

    /// The interval at which keepalive pings are sent. Zero means the
    /// 30-second default.
    pub ping_interval: Duration,

    /// The maximum span between a ping and its pong before the connection
    /// is terminated. Zero means twice the ping interval; other values
    /// are rounded up to a whole number of intervals.
    pub pong_timeout: Duration,

    /// Surface pong frames from [`Conn::next_frame`] as
    /// [`crate::FrameKind::Pong`] instead of consuming them. Meant for
    /// callers that track liveness themselves.
    pub observe_pongs: bool,
}

impl Options {
    /// Adds a subprotocol to offer, keeping preference order.
    pub fn with_protocol(mut self, name: impl Into<String>) -> Self {
        self.supported_protocols.push(name.into());
        self
    }

    /// Replaces the base request headers for the client handshake.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Sets the keepalive ping interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Sets the pong timeout.
    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// Surfaces pong frames to the receive path.
    pub fn with_observed_pongs(mut self) -> Self {
        self.observe_pongs = true;
        self
    }
}

/// Metadata from a completed handshake.
#[derive(Clone, Debug, Default)]
pub struct Handshake {
    /// The negotiated subprotocol, when one was selected.
    pub protocol: Option<String>,
    /// The WebSocket protocol version in use. Always 13.
    pub version: u8,
}

impl Conn {
    /// Dials a WebSocket URL, performing TCP connection establishment,
    /// TLS for `wss://`, and the upgrade handshake.
    ///
    /// # Example
    /// ```no_run
    /// use wsframe::{Conn, Options};
    ///
    /// async fn dial() -> wsframe::Result<()> {
    ///     let (conn, handshake) =
    ///         Conn::connect("wss://example.com/ws".parse()?, Options::default()).await?;
    ///     println!("subprotocol: {:?}", handshake.protocol);
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(url: Url, options: Options) -> Result<(Conn, Handshake)> {
        let host = url.host().expect("hostname").to_string();
        let port = url.port_or_known_default().expect("port");

        let tcp_stream = TcpStream::connect(format!("{host}:{port}")).await?;

        match url.scheme() {
            "ws" => Self::handshake(url, tcp_stream, options).await,
            "wss" => {
                let domain = ServerName::try_from(host)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname"))?;
                let stream = tls_connector().connect(domain, tcp_stream).await?;

                Self::handshake(url, stream, options).await
            }
            _ => Err(WebSocketError::InvalidHttpScheme),
        }
    }

    /// Performs the client-side upgrade handshake over an existing
    /// connection.
    ///
    /// The request carries `Upgrade`, `Connection`, a random
    /// `Sec-WebSocket-Key`, `Sec-WebSocket-Version: 13` and, when
    /// subprotocols are offered, `Sec-WebSocket-Protocol`. The response is
    /// accepted on status 101 after validating the upgrade headers, the
    /// accept key and the selected subprotocol; a 400 carrying
    /// `Sec-WebSocket-Version` reports the versions the server supports,
    /// and a 405 is reported as method-not-allowed.
    ///
    /// On success the keepalive loop starts with the cadence from
    /// `options`. Outgoing frames are sent unmasked, which deviates from
    /// the client-to-server masking requirement of RFC 6455; peers that
    /// enforce it will reject this client.
    pub async fn handshake<S>(url: Url, io: S, options: Options) -> Result<(Conn, Handshake)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        for protocol in &options.supported_protocols {
            validate_protocol_name(protocol)?;
        }

        let key = generate_key();

        let mut request = Request::builder()
            .method(Method::GET)
            .uri(&url[url::Position::BeforePath..])
            .body(Empty::<Bytes>::new())
            .expect("request build");

        let headers = request.headers_mut();
        if let Some(extra) = options.headers.as_ref() {
            for (name, value) in extra {
                headers.insert(name.clone(), value.clone());
            }
        }
        // allow the caller to set a custom Host header
        if !headers.contains_key(header::HOST) {
            let host = url.host().expect("hostname").to_string();
            let host_header = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host,
            };
            headers.insert(header::HOST, host_header.parse().expect("host header"));
        }
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_KEY, key.parse().expect("key header"));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        if !options.supported_protocols.is_empty() {
            let offer = options.supported_protocols.join(", ");
            headers.insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                offer.parse().expect("protocol header"),
            );
        }

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;

        tokio::spawn(async move {
            if let Err(err) = conn.with_upgrades().await {
                log::error!("upgrading connection: {err:?}");
            }
        });

        let mut response = sender.send_request(request).await?;
        let handshake = verify_response(&response, &key, &options)?;

        let upgraded = hyper::upgrade::on(&mut response).await?;
        let conn = Conn::from_stream(TokioIo::new(upgraded), &options);

        Ok((conn, handshake))
    }

    /// Handles an incoming upgrade request on the server side.
    ///
    /// Validates the request (GET only, upgrade headers, key, version 13),
    /// negotiates a subprotocol by first match in the client's offered
    /// order, and returns the `101 Switching Protocols` response to send
    /// back along with a future resolving to the connection once hyper
    /// completes the protocol switch.
    ///
    /// The response must be sent to the client before the future is
    /// awaited.
    ///
    /// # Example
    /// ```no_run
    /// use hyper::{body::Incoming, Request};
    /// use wsframe::{Conn, HttpResponse, Options};
    ///
    /// async fn serve(mut req: Request<Incoming>) -> wsframe::Result<HttpResponse> {
    ///     let (response, upgrade) = Conn::upgrade(&mut req, Options::default())?;
    ///
    ///     tokio::spawn(async move {
    ///         if let Ok((conn, _handshake)) = upgrade.await {
    ///             let _ = conn.send_text("welcome").await;
    ///         }
    ///     });
    ///
    ///     Ok(response)
    /// }
    /// ```
    pub fn upgrade<B>(
        mut request: impl std::borrow::BorrowMut<Request<B>>,
        options: Options,
    ) -> Result<(HttpResponse, UpgradeFut)> {
        let request = request.borrow_mut();

        if request.method() != Method::GET {
            return Err(WebSocketError::MethodNotAllowed);
        }

        let headers = request.headers();
        if !header_eq_ignore_case(headers, header::UPGRADE, "websocket") {
            return Err(WebSocketError::InvalidUpgradeHeader);
        }
        if !header_eq_ignore_case(headers, header::CONNECTION, "upgrade") {
            return Err(WebSocketError::InvalidConnectionHeader);
        }

        let key = headers
            .get(header::SEC_WEBSOCKET_KEY)
            .ok_or(WebSocketError::MissingSecWebSocketKey)?;
        if headers
            .get(header::SEC_WEBSOCKET_VERSION)
            .map(|v| v.as_bytes())
            != Some(b"13")
        {
            return Err(WebSocketError::InvalidSecWebSocketVersion);
        }

        let accept = accept_key(key.as_bytes());
        let protocol = negotiate_protocol(headers, &options.supported_protocols);

        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_ACCEPT, accept)
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .body(Empty::new())
            .expect("response build");

        if !options.supported_protocols.is_empty() {
            // an empty value tells the client no subprotocol was selected
            let value = protocol.clone().unwrap_or_default();
            response.headers_mut().insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                value.parse().expect("protocol header"),
            );
        }

        Ok((
            response,
            UpgradeFut {
                inner: hyper::upgrade::on(request),
                options: Some(options),
                protocol,
            },
        ))
    }
}

/// Future that completes a server-side upgrade, resolving to the
/// connection and its handshake metadata.
///
/// Returned by [`Conn::upgrade`]; it will not complete until the paired
/// HTTP response has been sent to the client.
#[pin_project]
#[derive(Debug)]
pub struct UpgradeFut {
    #[pin]
    inner: hyper::upgrade::OnUpgrade,
    options: Option<Options>,
    protocol: Option<String>,
}

impl std::future::Future for UpgradeFut {
    type Output = Result<(Conn, Handshake)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let upgraded = match this.inner.poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(res) => res?,
        };

        let options = this.options.take().expect("polled after completion");
        let conn = Conn::from_stream(TokioIo::new(upgraded), &options);
        let handshake = Handshake {
            protocol: this.protocol.take(),
            version: 13,
        };

        Poll::Ready(Ok((conn, handshake)))
    }
}

fn verify_response(
    response: &Response<Incoming>,
    key: &str,
    options: &Options,
) -> Result<Handshake> {
    let headers = response.headers();

    let status = response.status();
    if status != StatusCode::SWITCHING_PROTOCOLS {
        if status == StatusCode::BAD_REQUEST
            && headers.contains_key(header::SEC_WEBSOCKET_VERSION)
        {
            let versions = headers
                .get_all(header::SEC_WEBSOCKET_VERSION)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(WebSocketError::UnsupportedVersion(versions));
        }
        // reserved for a future HTTP/2 downgrade path
        if status == StatusCode::METHOD_NOT_ALLOWED {
            return Err(WebSocketError::MethodNotAllowed);
        }
        return Err(WebSocketError::InvalidStatusCode(status.as_u16()));
    }

    if !header_eq_ignore_case(headers, header::UPGRADE, "websocket") {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }
    if !header_eq_ignore_case(headers, header::CONNECTION, "upgrade") {
        return Err(WebSocketError::InvalidConnectionHeader);
    }
    if !header_eq_ignore_case(headers, header::SEC_WEBSOCKET_VERSION, "13") {
        return Err(WebSocketError::InvalidSecWebSocketVersion);
    }
    if !header_eq_ignore_case(headers, header::SEC_WEBSOCKET_ACCEPT, &accept_key(key.as_bytes())) {
        return Err(WebSocketError::InvalidAcceptKey);
    }

    // an absent or empty protocol header means no subprotocol was
    // negotiated; anything else must be one we offered
    let protocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    if let Some(protocol) = protocol.as_ref() {
        if !options.supported_protocols.iter().any(|name| name == protocol) {
            return Err(WebSocketError::UnsupportedSubprotocol(protocol.clone()));
        }
    }

    Ok(Handshake {
        protocol,
        version: 13,
    })
}

fn header_eq_ignore_case(headers: &HeaderMap, name: HeaderName, value: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case(value))
        .unwrap_or(false)
}

/// Picks the first of the client's offered subprotocols that the server
/// supports, preserving the client's preference order.
fn negotiate_protocol(headers: &HeaderMap, supported: &[String]) -> Option<String> {
    for value in headers.get_all(header::SEC_WEBSOCKET_PROTOCOL) {
        let Ok(value) = value.to_str() else { continue };
        for offered in value.split(',').map(str::trim) {
            if supported.iter().any(|name| name == offered) {
                return Some(offered.to_string());
            }
        }
    }
    None
}

/// Subprotocol names are restricted to `[A-Za-z]+` so they survive
/// comma-separated header encoding untouched.
fn validate_protocol_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(WebSocketError::InvalidSubprotocolName(name.to_string()));
    }
    Ok(())
}

/// TLS for `wss://` dials: the webpki root set over the
/// [*ring*](https://github.com/briansmith/ring) provider, offering
/// HTTP/1.1 for the upgrade request.
fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TlsConnector::from(Arc::new(config))
}

fn generate_key() -> String {
    use base64::prelude::*;
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

fn accept_key(key: &[u8]) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11"); // magic string
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_vector() {
        // the worked example from RFC 6455 section 1.3
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_validate_protocol_name() {
        assert!(validate_protocol_name("apple").is_ok());
        assert!(validate_protocol_name("ChatV").is_ok());

        assert!(validate_protocol_name("").is_err());
        assert!(validate_protocol_name("chat2").is_err());
        assert!(validate_protocol_name("a b").is_err());
        assert!(validate_protocol_name("soap+xml").is_err());
    }

    #[test]
    fn test_negotiate_protocol_client_preference() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            "pear, apple, orange".parse().unwrap(),
        );

        let supported = vec!["orange".to_string(), "apple".to_string()];
        // the client's order wins, not the server's
        assert_eq!(
            negotiate_protocol(&headers, &supported),
            Some("apple".to_string())
        );

        let none = vec!["grape".to_string()];
        assert_eq!(negotiate_protocol(&headers, &none), None);
        assert_eq!(negotiate_protocol(&HeaderMap::new(), &supported), None);
    }

    fn upgrade_request() -> Request<()> {
        Request::builder()
            .method(Method::GET)
            .uri("/ws")
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .body(())
            .unwrap()
    }

    #[test]
    fn test_upgrade_response_headers() {
        let mut request = upgrade_request();
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            "pear, apple".parse().unwrap(),
        );

        let options = Options::default()
            .with_protocol("apple")
            .with_protocol("orange");
        let (response, _fut) = Conn::upgrade(&mut request, options).expect("upgrade");

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        let headers = response.headers();
        assert_eq!(headers[header::UPGRADE], "websocket");
        assert_eq!(headers[header::CONNECTION], "Upgrade");
        assert_eq!(
            headers[header::SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert_eq!(headers[header::SEC_WEBSOCKET_VERSION], "13");
        assert_eq!(headers[header::SEC_WEBSOCKET_PROTOCOL], "apple");
    }

    #[test]
    fn test_upgrade_no_common_protocol_answers_empty() {
        let mut request = upgrade_request();
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, "pear".parse().unwrap());

        let options = Options::default()
            .with_protocol("apple")
            .with_protocol("orange");
        let (response, _fut) = Conn::upgrade(&mut request, options).expect("upgrade");

        assert_eq!(response.headers()[header::SEC_WEBSOCKET_PROTOCOL], "");
    }

    #[test]
    fn test_upgrade_rejects_bad_requests() {
        let mut request = upgrade_request();
        *request.method_mut() = Method::POST;
        assert!(matches!(
            Conn::upgrade(&mut request, Options::default()),
            Err(WebSocketError::MethodNotAllowed)
        ));

        let mut request = upgrade_request();
        request.headers_mut().remove(header::UPGRADE);
        assert!(matches!(
            Conn::upgrade(&mut request, Options::default()),
            Err(WebSocketError::InvalidUpgradeHeader)
        ));

        let mut request = upgrade_request();
        request.headers_mut().remove(header::SEC_WEBSOCKET_KEY);
        assert!(matches!(
            Conn::upgrade(&mut request, Options::default()),
            Err(WebSocketError::MissingSecWebSocketKey)
        ));

        let mut request = upgrade_request();
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_VERSION, "8".parse().unwrap());
        assert!(matches!(
            Conn::upgrade(&mut request, Options::default()),
            Err(WebSocketError::InvalidSecWebSocketVersion)
        ));
    }
}
