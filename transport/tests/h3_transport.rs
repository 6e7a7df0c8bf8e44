//! End-to-end transport tests over loopback QUIC: round trips through
//! both shims, error statuses, and mid-stream cancellation behaviour on
//! a shared connection.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use http::{Method, Request, StatusCode};
use quinn::crypto::rustls::QuicClientConfig;
use tempfile::TempDir;
use tokio::time::timeout;

use qprism_common::eps::EpsPriority;
use qprism_transport::mbtiles::MbtilesSource;
use qprism_transport::server::{serve, ShimKind, TileServer};
use qprism_transport::{client, http2, tls};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Large enough to span many 16 KiB chunks.
const LARGE_TILE_LEN: usize = 1024 * 1024;

fn make_fixture(dir: &Path) -> PathBuf {
    let path = dir.join("fixture.mbtiles");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE tiles (
             zoom_level INTEGER,
             tile_column INTEGER,
             tile_row INTEGER,
             tile_data BLOB
         );",
    )
    .unwrap();
    // slippy (z=1, x=0, y=0) -> tms row 1: a large gzip-looking payload
    let mut large = vec![0u8; LARGE_TILE_LEN];
    large[0] = 0x1f;
    large[1] = 0x8b;
    for (i, byte) in large.iter_mut().enumerate().skip(2) {
        *byte = (i % 251) as u8;
    }
    conn.execute(
        "INSERT INTO tiles VALUES (1, 0, 1, ?1)",
        rusqlite::params![large],
    )
    .unwrap();
    // slippy (z=1, x=1, y=1) -> tms row 0: a small plain payload
    conn.execute(
        "INSERT INTO tiles VALUES (1, 1, 0, x'0a0b0c0d')",
        rusqlite::params![],
    )
    .unwrap();
    path
}

async fn boot(kind: ShimKind, dir: &TempDir) -> TileServer {
    qprism_common::init();
    let mbtiles = make_fixture(dir.path());
    let tiles = MbtilesSource::open(&mbtiles).unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    serve(
        kind,
        "127.0.0.1:0".parse().unwrap(),
        &cert,
        &key,
        tiles,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn base_shim_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let server = boot(ShimKind::Base, &dir).await;
    let port = server.local_addr().port();

    let body = timeout(
        FETCH_TIMEOUT,
        client::fetch_tile_h3("127.0.0.1", port, "/tiles/1/1/1.pbf"),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(&body[..], &[0x0a, 0x0b, 0x0c, 0x0d]);

    let large = timeout(
        FETCH_TIMEOUT,
        client::fetch_tile_h3("127.0.0.1", port, "/tiles/1/0/0.pbf"),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(large.len(), LARGE_TILE_LEN);
    assert_eq!(&large[..2], &[0x1f, 0x8b]);

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_tile_and_bad_path_fail() {
    let dir = tempfile::tempdir().unwrap();
    let server = boot(ShimKind::Base, &dir).await;
    let port = server.local_addr().port();

    let missing = timeout(
        FETCH_TIMEOUT,
        client::fetch_tile_h3("127.0.0.1", port, "/tiles/1/0/1.pbf"),
    )
    .await
    .unwrap();
    assert!(missing.is_err());

    let bad_path = timeout(
        FETCH_TIMEOUT,
        client::fetch_tile_h3("127.0.0.1", port, "/maps/1/0/0.pbf"),
    )
    .await
    .unwrap();
    assert!(bad_path.is_err());

    server.shutdown().await;
}

#[tokio::test]
async fn prioritized_shim_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let server = boot(ShimKind::Prioritized, &dir).await;
    let port = server.local_addr().port();

    for eps in [
        EpsPriority {
            urgency: 0,
            incremental: true,
        },
        EpsPriority {
            urgency: 5,
            incremental: false,
        },
    ] {
        let body = timeout(
            FETCH_TIMEOUT,
            client::fetch_tile_qprism("127.0.0.1", port, "/tiles/1/1/1.pbf", eps),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&body[..], &[0x0a, 0x0b, 0x0c, 0x0d]);
    }

    server.shutdown().await;
}

#[tokio::test]
async fn h2_baseline_round_trip() {
    qprism_common::init();
    let dir = tempfile::tempdir().unwrap();
    let mbtiles = make_fixture(dir.path());
    let tiles = MbtilesSource::open(&mbtiles).unwrap();
    let server = http2::serve_h2("127.0.0.1:0".parse().unwrap(), tiles)
        .await
        .unwrap();
    let base_url = server.base_url();

    let body = timeout(
        FETCH_TIMEOUT,
        http2::fetch_tile_h2(&base_url, "/tiles/1/1/1.pbf"),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(&body[..], &[0x0a, 0x0b, 0x0c, 0x0d]);

    let missing = timeout(
        FETCH_TIMEOUT,
        http2::fetch_tile_h2(&base_url, "/tiles/1/0/1.pbf"),
    )
    .await
    .unwrap();
    assert!(missing.is_err());

    server.shutdown();
}

/// Reset a stream mid-transfer, then keep using the same connection:
/// the server must stop sending, skip trailers, and stay healthy for
/// subsequent requests.
#[tokio::test]
async fn cancellation_mid_stream_leaves_connection_usable() {
    let dir = tempfile::tempdir().unwrap();
    let server = boot(ShimKind::Base, &dir).await;
    let addr: SocketAddr = format!("127.0.0.1:{}", server.local_addr().port())
        .parse()
        .unwrap();

    let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().unwrap()).unwrap();
    let config = quinn::ClientConfig::new(Arc::new(
        QuicClientConfig::try_from(tls::insecure_client_crypto()).unwrap(),
    ));
    endpoint.set_default_client_config(config);
    let conn = endpoint.connect(addr, "127.0.0.1").unwrap().await.unwrap();
    let quic = conn.clone();
    let (mut driver, mut send_request) =
        h3::client::new(h3_quinn::Connection::new(conn)).await.unwrap();
    let drive = tokio::spawn(async move {
        let _ = futures_util::future::poll_fn(|cx| driver.poll_close(cx)).await;
    });

    // start the large transfer and walk away after the first chunk
    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("https://127.0.0.1:{}/tiles/1/0/0.pbf", addr.port()))
        .body(())
        .unwrap();
    let mut stream = send_request.send_request(request).await.unwrap();
    stream.finish().await.unwrap();
    let response = timeout(FETCH_TIMEOUT, stream.recv_response())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let first = timeout(FETCH_TIMEOUT, stream.recv_data())
        .await
        .unwrap()
        .unwrap();
    assert!(first.map(|b| b.remaining() > 0).unwrap_or(false));
    drop(stream);

    // the same connection still serves complete responses
    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("https://127.0.0.1:{}/tiles/1/1/1.pbf", addr.port()))
        .body(())
        .unwrap();
    let mut stream = send_request.send_request(request).await.unwrap();
    stream.finish().await.unwrap();
    let response = timeout(FETCH_TIMEOUT, stream.recv_response())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = BytesMut::new();
    while let Some(chunk) = timeout(FETCH_TIMEOUT, stream.recv_data())
        .await
        .unwrap()
        .unwrap()
    {
        body.put(chunk);
    }
    assert_eq!(&body[..], &[0x0a, 0x0b, 0x0c, 0x0d]);

    // non-GET requests are refused without killing the connection
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("https://127.0.0.1:{}/tiles/1/1/1.pbf", addr.port()))
        .body(())
        .unwrap();
    let mut stream = send_request.send_request(request).await.unwrap();
    stream.finish().await.unwrap();
    let response = timeout(FETCH_TIMEOUT, stream.recv_response())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    drop(send_request);
    quic.close(0u32.into(), b"");
    endpoint.wait_idle().await;
    drive.abort();
    server.shutdown().await;
}
