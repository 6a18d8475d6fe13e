//! End-to-end tests driving a real `h2::server::Connection` as the peer over
//! an in-process `tokio::io::duplex` transport (the same "mock peer over a
//! loopback transport" shape as the teacher's old `tests/flow_control.rs`,
//! updated from futures 0.1 mocks to async/await).

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use h2engine::config::Config;
use h2engine::connection::OutgoingRequest;
use h2engine::message::State;
use h2engine::metrics::Metrics;
use h2engine::Connection;
use http::{HeaderMap, Method, Response};
use tokio::io::AsyncRead;

async fn pair() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
    tokio::io::duplex(1024 * 1024)
}

fn get(path: &str) -> OutgoingRequest {
    OutgoingRequest {
        method: Method::GET,
        scheme: "https",
        authority: "example.com".to_string(),
        path: path.to_string(),
        query: None,
        headers: HeaderMap::new(),
        body: None,
        metrics: None,
    }
}

async fn read_body_to_vec(body: &mut h2engine::body::ResponseBodyStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = futures_util::future::poll_fn(|cx| body.poll_read(cx, &mut buf))
            .await
            .expect("read response body");
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

async fn read_request_body(body: &mut h2::RecvStream) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let chunk = futures_util::future::poll_fn(|cx| body.poll_data(cx)).await;
        match chunk {
            Some(Ok(bytes)) => {
                let _ = body.flow_control().release_capacity(bytes.len());
                out.extend_from_slice(&bytes);
            }
            Some(Err(e)) => panic!("request body error: {e}"),
            None => break,
        }
    }
    out
}

/// `GET /` returns "Hello world".
#[tokio::test]
async fn get_root_returns_hello_world() {
    let (client_io, server_io) = pair().await;

    let server = tokio::spawn(async move {
        let mut server = h2::server::handshake(server_io).await.unwrap();
        let (request, mut respond) = server.accept().await.unwrap().unwrap();
        assert_eq!(request.uri().path(), "/");
        let response = Response::new(());
        let mut send = respond.send_response(response, false).unwrap();
        send.send_data(Bytes::from_static(b"Hello world"), true).unwrap();
        assert!(server.accept().await.is_none());
    });

    let mut conn = Connection::handshake(client_io, Config::default()).await.unwrap();
    let msg = conn
        .submit(get("/"), Box::new(|_| {}))
        .await
        .unwrap();

    conn.run_until(msg, State::ReadData).await.unwrap();
    let mut body = conn.get_response_istream(msg).unwrap();
    let bytes = read_body_to_vec(&mut body).await;
    assert_eq!(bytes, b"Hello world");

    conn.note_body_eof(msg);
    conn.run_until(msg, State::ReadDone).await.unwrap();
    conn.finished(msg);

    server.await.unwrap();
}

/// `GET /no-content` returns 204 with an empty body and no real stream.
#[tokio::test]
async fn no_content_response_skips_body_stream() {
    let (client_io, server_io) = pair().await;

    let server = tokio::spawn(async move {
        let mut server = h2::server::handshake(server_io).await.unwrap();
        let (_request, mut respond) = server.accept().await.unwrap().unwrap();
        let response = Response::builder().status(204).body(()).unwrap();
        respond.send_response(response, true).unwrap();
        assert!(server.accept().await.is_none());
    });

    let mut conn = Connection::handshake(client_io, Config::default()).await.unwrap();
    let msg = conn.submit(get("/no-content"), Box::new(|_| {})).await.unwrap();

    conn.run_until(msg, State::ReadData).await.unwrap();
    assert!(conn.in_progress(msg));

    let mut body = conn.get_response_istream(msg).unwrap();
    assert!(body.is_complete());
    let bytes = read_body_to_vec(&mut body).await;
    assert!(bytes.is_empty());

    conn.note_body_eof(msg);
    conn.run_until(msg, State::ReadDone).await.unwrap();
    conn.finished(msg);

    server.await.unwrap();
}

/// `GET /large` reassembles a response of `24 * 1024 + 1` bytes exactly.
#[tokio::test]
async fn large_response_body_reassembles_exactly() {
    const SIZE: usize = 24 * 1024 + 1;
    let (client_io, server_io) = pair().await;

    let server = tokio::spawn(async move {
        let mut server = h2::server::handshake(server_io).await.unwrap();
        let (_request, mut respond) = server.accept().await.unwrap().unwrap();
        let response = Response::new(());
        let mut send = respond.send_response(response, false).unwrap();
        let payload = vec![0xABu8; SIZE];
        let mut sent = 0;
        while sent < payload.len() {
            let chunk_len = std::cmp::min(8192, payload.len() - sent);
            send.reserve_capacity(chunk_len);
            let _ = futures_util::future::poll_fn(|cx| send.poll_capacity(cx)).await;
            let end = sent + chunk_len == payload.len();
            send.send_data(Bytes::copy_from_slice(&payload[sent..sent + chunk_len]), end)
                .unwrap();
            sent += chunk_len;
        }
        assert!(server.accept().await.is_none());
    });

    let mut conn = Connection::handshake(client_io, Config::default()).await.unwrap();
    let msg = conn.submit(get("/large"), Box::new(|_| {})).await.unwrap();

    conn.run_until(msg, State::ReadData).await.unwrap();
    let mut body = conn.get_response_istream(msg).unwrap();
    let bytes = read_body_to_vec(&mut body).await;
    assert_eq!(bytes.len(), SIZE);

    conn.note_body_eof(msg);
    conn.finished(msg);

    server.await.unwrap();
}

/// Two parallel `GET /echo_query?...` on one connection both complete, each
/// body matches its own query, and both observe the same connection id.
#[tokio::test]
async fn parallel_requests_share_one_connection() {
    let (client_io, server_io) = pair().await;

    let server = tokio::spawn(async move {
        let mut server = h2::server::handshake(server_io).await.unwrap();
        for _ in 0..2 {
            let (request, mut respond) = server.accept().await.unwrap().unwrap();
            let query = request.uri().query().unwrap_or("").as_bytes().to_vec();
            let response = Response::new(());
            let mut send = respond.send_response(response, false).unwrap();
            send.send_data(Bytes::from(query), true).unwrap();
        }
        assert!(server.accept().await.is_none());
    });

    let mut conn = Connection::handshake(client_io, Config::default()).await.unwrap();

    let mut req1 = get("/echo_query");
    req1.query = Some("body%201".to_string());
    let mut req2 = get("/echo_query");
    req2.query = Some("body%202".to_string());

    let conn_id = conn.id();
    let msg1 = conn.submit(req1, Box::new(|_| {})).await.unwrap();
    let msg2 = conn.submit(req2, Box::new(|_| {})).await.unwrap();

    conn.run_until(msg1, State::ReadData).await.unwrap();
    conn.run_until(msg2, State::ReadData).await.unwrap();

    let mut body1 = conn.get_response_istream(msg1).unwrap();
    let mut body2 = conn.get_response_istream(msg2).unwrap();
    assert_eq!(read_body_to_vec(&mut body1).await, b"body%201");
    assert_eq!(read_body_to_vec(&mut body2).await, b"body%202");
    assert_eq!(conn.id(), conn_id);

    conn.note_body_eof(msg1);
    conn.note_body_eof(msg2);
    conn.finished(msg1);
    conn.finished(msg2);

    server.await.unwrap();
}

/// `POST /echo_post` with body "body 1" gets back a response body of
/// "body 1"; request-body metrics reflect the bytes sent.
#[tokio::test]
async fn post_body_is_echoed_and_metered() {
    let (client_io, server_io) = pair().await;

    let server = tokio::spawn(async move {
        let mut server = h2::server::handshake(server_io).await.unwrap();
        let (request, mut respond) = server.accept().await.unwrap().unwrap();
        let mut body = request.into_body();
        let received = read_request_body(&mut body).await;
        let response = Response::new(());
        let mut send = respond.send_response(response, false).unwrap();
        send.send_data(Bytes::from(received), true).unwrap();
        assert!(server.accept().await.is_none());
    });

    let metrics = Metrics::new();
    let mut conn = Connection::handshake(client_io, Config::default()).await.unwrap();

    let mut req = get("/echo_post");
    req.method = Method::POST;
    req.metrics = Some(metrics.clone());
    let source: Pin<Box<dyn AsyncRead + Send>> = Box::pin(std::io::Cursor::new(b"body 1".to_vec()));
    req.body = Some(h2engine::body::RequestBodySource::Pollable(source));

    let msg = conn.submit(req, Box::new(|_| {})).await.unwrap();
    conn.run_until(msg, State::ReadData).await.unwrap();

    let mut body = conn.get_response_istream(msg).unwrap();
    let bytes = read_body_to_vec(&mut body).await;
    assert_eq!(bytes, b"body 1");

    assert_eq!(metrics.request_body_bytes(), 6);
    assert!(metrics.response_body_bytes() >= 6);

    conn.note_body_eof(msg);
    conn.finished(msg);

    server.await.unwrap();
}

/// A blocking-source POST body delivered in two chunks with a pause
/// between; the server-observed body is the concatenation of both.
#[tokio::test]
async fn blocking_body_source_delivers_chunks_in_order() {
    let (client_io, server_io) = pair().await;

    let server = tokio::spawn(async move {
        let mut server = h2::server::handshake(server_io).await.unwrap();
        let (request, _respond) = server.accept().await.unwrap().unwrap();
        let mut body = request.into_body();
        let received = read_request_body(&mut body).await;
        assert_eq!(received, b"Part 1 - Part 2");
    });

    let mut conn = Connection::handshake(client_io, Config::default()).await.unwrap();

    let chunks = std::sync::Arc::new(std::sync::Mutex::new(vec![
        b"Part 1 -".to_vec(),
        b" Part 2".to_vec(),
    ]));
    let read_fn: h2engine::body::BlockingRead = Box::new(move |_len| {
        std::thread::sleep(Duration::from_millis(5));
        let mut chunks = chunks.lock().unwrap();
        if chunks.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(chunks.remove(0))
        }
    });

    let mut req = get("/echo_post");
    req.method = Method::POST;
    req.body = Some(h2engine::body::RequestBodySource::Blocking(read_fn));

    let msg = conn.submit(req, Box::new(|_| {})).await.unwrap();
    conn.run_until(msg, State::WriteDone).await.unwrap();
    conn.finished(msg);

    server.await.unwrap();
}

/// A handful of concurrent requests on one connection all complete and all
/// see the same connection id; the multiplexing property under test doesn't
/// depend on the specific count.
#[tokio::test]
async fn many_concurrent_requests_share_one_connection() {
    const N: usize = 16;
    let (client_io, server_io) = pair().await;

    let server = tokio::spawn(async move {
        let mut server = h2::server::handshake(server_io).await.unwrap();
        for _ in 0..N {
            let (_request, mut respond) = server.accept().await.unwrap().unwrap();
            let response = Response::new(());
            let mut send = respond.send_response(response, false).unwrap();
            send.send_data(Bytes::from_static(b"Hello world"), true).unwrap();
        }
        assert!(server.accept().await.is_none());
    });

    let mut conn = Connection::handshake(client_io, Config::default()).await.unwrap();
    let conn_id = conn.id();

    let mut msgs = Vec::with_capacity(N);
    for _ in 0..N {
        msgs.push(conn.submit(get("/slow"), Box::new(|_| {})).await.unwrap());
    }

    for &msg in &msgs {
        conn.run_until(msg, State::ReadData).await.unwrap();
        let mut body = conn.get_response_istream(msg).unwrap();
        assert_eq!(read_body_to_vec(&mut body).await, b"Hello world");
        assert_eq!(conn.id(), conn_id);
        conn.note_body_eof(msg);
        conn.finished(msg);
    }

    server.await.unwrap();
}

/// A `RST_STREAM` from the peer latches a protocol error on the message
/// instead of silently completing it.
#[tokio::test]
async fn rst_stream_latches_protocol_error() {
    let (client_io, server_io) = pair().await;

    let server = tokio::spawn(async move {
        let mut server = h2::server::handshake(server_io).await.unwrap();
        let (_request, respond) = server.accept().await.unwrap().unwrap();
        drop(respond);
        assert!(server.accept().await.is_none());
    });

    let mut conn = Connection::handshake(client_io, Config::default()).await.unwrap();
    let msg = conn.submit(get("/boom"), Box::new(|_| {})).await.unwrap();

    let result = conn.run_until(msg, State::ReadData).await;
    assert!(result.is_err());
    conn.finished(msg);

    server.await.unwrap();
}

#[tokio::test]
async fn pause_unpause_is_a_diagnostic_only_toggle() {
    let (client_io, server_io) = pair().await;

    let server = tokio::spawn(async move {
        let mut server = h2::server::handshake(server_io).await.unwrap();
        let (_request, mut respond) = server.accept().await.unwrap().unwrap();
        let response = Response::new(());
        let mut send = respond.send_response(response, false).unwrap();
        send.send_data(Bytes::from_static(b"Hello world"), true).unwrap();
        assert!(server.accept().await.is_none());
    });

    let mut conn = Connection::handshake(client_io, Config::default()).await.unwrap();
    let msg = conn.submit(get("/"), Box::new(|_| {})).await.unwrap();

    conn.pause(msg);
    conn.unpause(msg);

    conn.run_until(msg, State::ReadData).await.unwrap();
    let mut body = conn.get_response_istream(msg).unwrap();
    assert_eq!(read_body_to_vec(&mut body).await, b"Hello world");

    conn.note_body_eof(msg);
    conn.finished(msg);

    server.await.unwrap();
}
