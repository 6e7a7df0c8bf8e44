//! QUIC/HTTP-3 tile transport: server shims, one-shot clients, the HTTP/2
//! baseline pair, and the MBTiles byte source they all share.

pub mod client;
pub mod http2;
pub mod mbtiles;
pub mod metrics;
pub mod server;
pub mod tls;

/// ALPN protocol identifier negotiated by both shims and clients.
pub const ALPN_H3: &[u8] = b"h3";

/// Response bodies are sent in chunks of at most this many bytes, with a
/// cooperative yield between chunks.
pub const CHUNK_BYTES: usize = 16 * 1024;

/// Application error code used when a stream is reset mid-transfer.
pub const H3_REQUEST_CANCELLED: u64 = 0x010C;
