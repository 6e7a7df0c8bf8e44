//! HTTP/2 baseline pair: an axum tile endpoint and a prior-knowledge
//! reqwest client. Same path grammar and response headers as the H3
//! shims, no priority signalling and no mid-stream scheduling.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::mbtiles::MbtilesSource;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

pub struct H2Server {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl H2Server {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

/// Bind the baseline server; use port 0 and `local_addr` for discovery.
pub async fn serve_h2(addr: SocketAddr, tiles: MbtilesSource) -> Result<H2Server> {
    let app = Router::new()
        .route("/tiles/{z}/{x}/{y}", get(tile_handler))
        .with_state(tiles);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind HTTP/2 listener")?;
    let local_addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP/2 baseline server failed");
        }
    });
    tracing::info!(%local_addr, "HTTP/2 baseline server listening");
    Ok(H2Server { local_addr, task })
}

async fn tile_handler(
    State(tiles): State<MbtilesSource>,
    Path((z, x, y)): Path<(String, String, String)>,
) -> Response {
    let parsed = (
        z.parse::<u8>().ok(),
        x.parse::<u32>().ok(),
        y.split('.').next().and_then(|s| s.parse::<u32>().ok()),
    );
    let (Some(z), Some(x), Some(y)) = parsed else {
        return not_found();
    };
    match tiles.tile_data(z, x, y).await {
        Ok(data) if !data.is_empty() => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/x-protobuf"),
            );
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=60"),
            );
            if data.starts_with(GZIP_MAGIC) {
                headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            }
            (StatusCode::OK, headers, Bytes::from(data)).into_response()
        }
        Ok(_) => not_found(),
        Err(e) => {
            tracing::warn!(error = %e, z, x, "tile lookup failed");
            not_found()
        }
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Bytes::new()).into_response()
}

/// Fetch one tile from the baseline server over HTTP/2.
pub async fn fetch_tile_h2(base_url: &str, tile_path: &str) -> Result<Bytes> {
    let client = reqwest::Client::builder()
        .http2_prior_knowledge()
        .build()
        .context("build HTTP/2 client")?;
    let url = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        tile_path.trim_start_matches('/')
    );
    let response = client.get(&url).send().await.context("send tile request")?;
    let status = response.status();
    if status.as_u16() >= 400 {
        bail!("tile fetch failed with status {status}");
    }
    response.bytes().await.context("read tile body")
}
