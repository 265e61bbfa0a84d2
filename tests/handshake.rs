//! End-to-end handshake tests: a hyper server on one end of an in-memory
//! duplex stream, the client dialer on the other.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{body::Incoming, header, service::service_fn, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use wsframe::{Conn, FrameKind, Options, WebSocketError};

async fn read_all(conn: &Conn) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = conn.read(&mut buf).await.expect("read payload");
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    data
}

#[tokio::test]
async fn test_upgrade_end_to_end() {
    let (client_io, server_io) = tokio::io::duplex(8192);

    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));

    tokio::spawn(async move {
        let service = service_fn(move |mut req: Request<Incoming>| {
            let done_tx = Arc::clone(&done_tx);
            async move {
                let options = Options::default()
                    .with_protocol("apple")
                    .with_protocol("orange");
                let (response, upgrade) = Conn::upgrade(&mut req, options)?;

                tokio::spawn(async move {
                    let (conn, handshake) = upgrade.await.expect("server upgrade");
                    assert_eq!(handshake.protocol.as_deref(), Some("apple"));
                    let conn = Arc::new(conn);

                    conn.send_text("hello").await.expect("send hello");

                    assert_eq!(
                        conn.next_frame().await.expect("server frame"),
                        FrameKind::Text
                    );
                    assert_eq!(read_all(&conn).await, b"hello");

                    let reader = {
                        let conn = Arc::clone(&conn);
                        tokio::spawn(async move { conn.next_frame().await })
                    };
                    conn.close(Duration::from_secs(5), 1000, "goodbye")
                        .await
                        .expect("graceful close");
                    assert!(matches!(
                        reader.await.unwrap(),
                        Err(WebSocketError::ConnectionClosed)
                    ));

                    if let Some(done) = done_tx.lock().unwrap().take() {
                        let _ = done.send(());
                    }
                });

                Ok::<_, WebSocketError>(response)
            }
        });

        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(server_io), service)
            .with_upgrades()
            .await;
    });

    let options = Options::default().with_protocol("pear").with_protocol("apple");
    let (conn, handshake) = Conn::handshake(
        "ws://example.com/testws".parse().unwrap(),
        client_io,
        options,
    )
    .await
    .expect("client handshake");

    assert_eq!(handshake.protocol.as_deref(), Some("apple"));
    assert_eq!(handshake.version, 13);

    assert_eq!(conn.next_frame().await.expect("client frame"), FrameKind::Text);
    assert_eq!(read_all(&conn).await, b"hello");

    conn.start_text_stream().await.expect("start stream");
    conn.write(b"hello").await.expect("stream write");
    conn.end().await.expect("stream end");

    match conn.next_frame().await {
        Err(WebSocketError::ClosedByPeer(reason)) => {
            assert_eq!(reason.code(), Some(1000));
            assert_eq!(reason.reason(), Some("goodbye"));
        }
        other => panic!("expected closed-by-peer, got {other:?}"),
    }

    done_rx.await.expect("server side completed");
}

#[tokio::test]
async fn test_no_common_subprotocol_still_connects() {
    let (client_io, server_io) = tokio::io::duplex(8192);

    tokio::spawn(async move {
        let service = service_fn(|mut req: Request<Incoming>| async move {
            let options = Options::default()
                .with_protocol("apple")
                .with_protocol("orange");
            let (response, upgrade) = Conn::upgrade(&mut req, options)?;

            tokio::spawn(async move {
                let (conn, handshake) = upgrade.await.expect("server upgrade");
                assert_eq!(handshake.protocol, None);
                conn.send_text("hi").await.expect("send");
            });

            Ok::<_, WebSocketError>(response)
        });

        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(server_io), service)
            .with_upgrades()
            .await;
    });

    let options = Options::default().with_protocol("pear");
    let (conn, handshake) = Conn::handshake(
        "ws://example.com/testws".parse().unwrap(),
        client_io,
        options,
    )
    .await
    .expect("client handshake");

    // the empty Sec-WebSocket-Protocol answer means "none negotiated"
    assert_eq!(handshake.protocol, None);

    assert_eq!(conn.next_frame().await.expect("frame"), FrameKind::Text);
    assert_eq!(read_all(&conn).await, b"hi");
}

#[tokio::test]
async fn test_handshake_rejects_unexpected_status() {
    let (client_io, server_io) = tokio::io::duplex(4096);

    tokio::spawn(async move {
        let service = service_fn(|_req: Request<Incoming>| async move {
            Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(Empty::<Bytes>::new())
        });
        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(server_io), service)
            .await;
    });

    let err = Conn::handshake(
        "ws://example.com/".parse().unwrap(),
        client_io,
        Options::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, WebSocketError::InvalidStatusCode(403)), "{err:?}");
}

#[tokio::test]
async fn test_handshake_reports_server_versions() {
    let (client_io, server_io) = tokio::io::duplex(4096);

    tokio::spawn(async move {
        let service = service_fn(|_req: Request<Incoming>| async move {
            Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .header(header::SEC_WEBSOCKET_VERSION, "8, 7")
                .body(Empty::<Bytes>::new())
        });
        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(server_io), service)
            .await;
    });

    let err = Conn::handshake(
        "ws://example.com/".parse().unwrap(),
        client_io,
        Options::default(),
    )
    .await
    .unwrap_err();
    match err {
        WebSocketError::UnsupportedVersion(versions) => assert_eq!(versions, "8, 7"),
        other => panic!("expected version report, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_rejects_bad_protocol_name_locally() {
    let (client_io, _server_io) = tokio::io::duplex(4096);

    let err = Conn::handshake(
        "ws://example.com/".parse().unwrap(),
        client_io,
        Options::default().with_protocol("chat2"),
    )
    .await
    .unwrap_err();
    match err {
        WebSocketError::InvalidSubprotocolName(name) => assert_eq!(name, "chat2"),
        other => panic!("expected local rejection, got {other:?}"),
    }
}
