//! One-shot HTTP/3 tile clients.
//!
//! Each fetch opens its own QUIC connection (verification off; the
//! testbed talks to itself over loopback), issues a single `GET`, and
//! accumulates the body until end-of-stream. The QPRISM variant adds the
//! RFC 9218 `priority` request header.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, Request};
use quinn::crypto::rustls::QuicClientConfig;

use qprism_common::eps::EpsPriority;

use crate::tls;

/// Fetch one tile over HTTP/3, no priority signalling.
pub async fn fetch_tile_h3(server: &str, port: u16, tile_path: &str) -> Result<Bytes> {
    fetch(server, port, tile_path, None).await
}

/// Fetch one tile over HTTP/3 with a `priority: u=<urgency>[, i]` header.
pub async fn fetch_tile_qprism(
    server: &str,
    port: u16,
    tile_path: &str,
    priority: EpsPriority,
) -> Result<Bytes> {
    fetch(server, port, tile_path, Some(priority)).await
}

async fn fetch(
    server: &str,
    port: u16,
    tile_path: &str,
    priority: Option<EpsPriority>,
) -> Result<Bytes> {
    let addr = (server, port)
        .to_socket_addrs()
        .context("resolve server address")?
        .next()
        .context("no address for server")?;
    let endpoint = client_endpoint(addr)?;
    let conn = endpoint
        .connect(addr, server)
        .context("start QUIC connection")?
        .await
        .context("QUIC handshake")?;
    let quic = conn.clone();
    let (mut driver, mut send_request) = h3::client::new(h3_quinn::Connection::new(conn))
        .await
        .context("establish HTTP/3 connection")?;
    let drive = tokio::spawn(async move {
        let _ = futures_util::future::poll_fn(|cx| driver.poll_close(cx)).await;
    });

    let mut request = Request::builder()
        .method(Method::GET)
        .uri(format!("https://{server}:{port}{tile_path}"));
    if let Some(priority) = priority {
        request = request.header("priority", priority.header_value());
    }
    let request = request.body(()).context("build request")?;

    let mut stream = send_request
        .send_request(request)
        .await
        .context("send request")?;
    stream.finish().await.context("finish request stream")?;

    let response = stream
        .recv_response()
        .await
        .context("receive response headers")?;
    let status = response.status();
    if status.as_u16() >= 400 {
        quic.close(0u32.into(), b"");
        bail!("tile fetch failed with status {status}");
    }

    let mut body = BytesMut::new();
    while let Some(chunk) = stream
        .recv_data()
        .await
        .context("receive response body")?
    {
        body.put(chunk);
    }

    drop(stream);
    drop(send_request);
    quic.close(0u32.into(), b"");
    endpoint.wait_idle().await;
    drive.abort();
    Ok(body.freeze())
}

fn client_endpoint(addr: SocketAddr) -> Result<quinn::Endpoint> {
    let bind: SocketAddr = if addr.is_ipv6() {
        "[::]:0".parse()?
    } else {
        "0.0.0.0:0".parse()?
    };
    let mut endpoint = quinn::Endpoint::client(bind).context("bind client endpoint")?;
    let crypto = tls::insecure_client_crypto();
    let config = quinn::ClientConfig::new(Arc::new(
        QuicClientConfig::try_from(crypto).context("build QUIC client config")?,
    ));
    endpoint.set_default_client_config(config);
    Ok(endpoint)
}
