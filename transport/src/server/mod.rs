//! QUIC/HTTP-3 tile endpoint.
//!
//! The base shim admits every request in arrival order; the prioritised
//! shim routes admissions through a per-connection urgency queue first
//! (see [`prioritized`]). Both serve `GET /tiles/{z}/{x}/{y}.pbf` out of
//! an MBTiles source, stream the body in bounded chunks with a
//! cooperative yield between chunks, and abort cleanly when the peer
//! resets a stream (application error code `H3_REQUEST_CANCELLED`,
//! 0x010C).

mod prioritized;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use h3::error::{Code, ErrorLevel};
use http::{Method, Request, Response, StatusCode};
use quinn::crypto::rustls::QuicServerConfig;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::mbtiles::MbtilesSource;
use crate::{metrics, tls, CHUNK_BYTES};

pub(crate) type ServerStream = h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

/// Which admission discipline a server runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimKind {
    /// Admit requests immediately, in arrival order.
    Base,
    /// Admit through a per-connection `(urgency, arrival)` queue.
    Prioritized,
}

/// A running tile server; dropping it without `shutdown` leaves the
/// accept loop running until the endpoint is dropped.
pub struct TileServer {
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl TileServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;
    }
}

/// Bind a QUIC endpoint (ALPN `h3`) and start accepting connections.
///
/// Certificates are loaded from the given paths, generating a
/// self-signed pair on first boot. Bind with port 0 and read
/// [`TileServer::local_addr`] to discover the chosen port.
pub async fn serve(
    kind: ShimKind,
    addr: SocketAddr,
    cert_path: &Path,
    key_path: &Path,
    tiles: MbtilesSource,
) -> Result<TileServer> {
    let (certs, key) = tls::load_or_generate(cert_path, key_path)?;
    let crypto = tls::server_crypto(certs, key)?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(
        QuicServerConfig::try_from(crypto).context("build QUIC server config")?,
    ));
    let endpoint = quinn::Endpoint::server(server_config, addr).context("bind QUIC endpoint")?;
    let local_addr = endpoint.local_addr()?;
    let cancel = CancellationToken::new();
    tokio::spawn(accept_loop(endpoint.clone(), kind, tiles, cancel.clone()));
    tracing::info!(%local_addr, ?kind, "tile server listening");
    Ok(TileServer {
        endpoint,
        local_addr,
        cancel,
    })
}

async fn accept_loop(
    endpoint: quinn::Endpoint,
    kind: ShimKind,
    tiles: MbtilesSource,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let tiles = tiles.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(incoming, kind, tiles, cancel).await {
                        tracing::debug!(error = %e, "connection ended");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    incoming: quinn::Incoming,
    kind: ShimKind,
    tiles: MbtilesSource,
    shutdown: CancellationToken,
) -> Result<()> {
    let conn = incoming.await.context("accept QUIC connection")?;
    let remote = conn.remote_address();
    let h3_conn = h3::server::Connection::new(h3_quinn::Connection::new(conn))
        .await
        .context("establish HTTP/3 connection")?;
    tracing::debug!(%remote, "connection established");
    match kind {
        ShimKind::Base => serve_streams(h3_conn, tiles, shutdown).await,
        ShimKind::Prioritized => prioritized::serve_streams(h3_conn, tiles, shutdown).await,
    }
}

/// Base admission: spawn a handler per stream as headers arrive.
async fn serve_streams(
    mut conn: h3::server::Connection<h3_quinn::Connection, Bytes>,
    tiles: MbtilesSource,
    shutdown: CancellationToken,
) -> Result<()> {
    let conn_cancel = shutdown.child_token();
    let mut tasks = JoinSet::new();
    loop {
        while tasks.try_join_next().is_some() {}
        tokio::select! {
            _ = conn_cancel.cancelled() => break,
            accepted = conn.accept() => match accepted {
                Ok(Some((req, stream))) => {
                    let tiles = tiles.clone();
                    let cancel = conn_cancel.clone();
                    tasks.spawn(handle_request(req, stream, tiles, cancel));
                }
                Ok(None) => break,
                Err(err) => match err.get_error_level() {
                    ErrorLevel::ConnectionError => break,
                    ErrorLevel::StreamError => continue,
                },
            },
        }
    }
    // connection gone: stop every per-stream task that is still sending
    conn_cancel.cancel();
    tasks.shutdown().await;
    Ok(())
}

/// Serve one request stream to completion, cancellation, or error.
pub(crate) async fn handle_request(
    req: Request<()>,
    mut stream: ServerStream,
    tiles: MbtilesSource,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {
            stream.stop_stream(Code::H3_REQUEST_CANCELLED);
        }
        res = respond(req, &mut stream, &tiles) => {
            if let Err(e) = res {
                tracing::debug!(error = %e, "request stream ended early");
            }
        }
    }
}

async fn respond(
    req: Request<()>,
    stream: &mut ServerStream,
    tiles: &MbtilesSource,
) -> Result<()> {
    if req.method() != Method::GET {
        metrics::request_rejected("method");
        return send_status(stream, StatusCode::METHOD_NOT_ALLOWED).await;
    }
    let Some((z, x, y)) = parse_tile_path(req.uri().path()) else {
        metrics::request_rejected("path");
        return send_status(stream, StatusCode::NOT_FOUND).await;
    };
    let data = match tiles.tile_data(z, x, y).await {
        Ok(data) if !data.is_empty() => data,
        Ok(_) => {
            metrics::tile_not_found(z);
            return send_status(stream, StatusCode::NOT_FOUND).await;
        }
        Err(e) => {
            tracing::warn!(error = %e, z, x, y, "tile lookup failed");
            metrics::tile_not_found(z);
            return send_status(stream, StatusCode::NOT_FOUND).await;
        }
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/x-protobuf")
        .header(http::header::CACHE_CONTROL, "public, max-age=60");
    if data.starts_with(GZIP_MAGIC) {
        response = response.header(http::header::CONTENT_ENCODING, "gzip");
    }
    let response = response.body(()).context("build response")?;
    stream
        .send_response(response)
        .await
        .context("send response headers")?;

    let total = data.len();
    let mut body = Bytes::from(data);
    while !body.is_empty() {
        let chunk = body.split_to(body.len().min(CHUNK_BYTES));
        if let Err(e) = stream.send_data(chunk).await {
            // the peer reset the stream between chunks: stop inside this
            // chunk boundary, no trailing frames
            tracing::debug!(error = %e, z, x, y, "send cancelled mid-stream");
            metrics::tile_send_cancelled(z);
            stream.stop_stream(Code::H3_REQUEST_CANCELLED);
            return Ok(());
        }
        tokio::task::yield_now().await;
    }
    stream.finish().await.context("finish stream")?;
    metrics::tile_served(z, total);
    Ok(())
}

async fn send_status(stream: &mut ServerStream, status: StatusCode) -> Result<()> {
    let response = Response::builder()
        .status(status)
        .body(())
        .context("build response")?;
    stream.send_response(response).await.context("send status")?;
    stream.finish().await.context("finish stream")?;
    Ok(())
}

/// Parse `/tiles/{z}/{x}/{y}.pbf`, ignoring any query string. The
/// extension is stripped rather than validated.
fn parse_tile_path(path: &str) -> Option<(u8, u32, u32)> {
    let path = path.split('?').next().unwrap_or_default();
    let mut parts = path.trim_matches('/').split('/');
    if parts.next()? != "tiles" {
        return None;
    }
    let z = parts.next()?.parse().ok()?;
    let x = parts.next()?.parse().ok()?;
    let y = parts.next()?.split('.').next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((z, x, y))
}

#[cfg(test)]
mod tests {
    use super::parse_tile_path;

    #[test]
    fn parses_tile_paths() {
        assert_eq!(parse_tile_path("/tiles/12/1205/1539.pbf"), Some((12, 1205, 1539)));
        assert_eq!(parse_tile_path("/tiles/12/1205/1539.pbf?v=2"), Some((12, 1205, 1539)));
        assert_eq!(parse_tile_path("tiles/0/0/0.pbf"), Some((0, 0, 0)));
        assert_eq!(parse_tile_path("/tiles/12/1205/1539"), Some((12, 1205, 1539)));
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(parse_tile_path("/"), None);
        assert_eq!(parse_tile_path("/maps/12/1/2.pbf"), None);
        assert_eq!(parse_tile_path("/tiles/12/1.pbf"), None);
        assert_eq!(parse_tile_path("/tiles/12/a/2.pbf"), None);
        assert_eq!(parse_tile_path("/tiles/12/1/2.pbf/extra"), None);
        assert_eq!(parse_tile_path("/tiles/999/1/2.pbf"), None);
    }
}
