//! Prioritised admission over the base shim.
//!
//! Streams are not handled as they arrive. The accept loop parses the
//! RFC 9218 `priority` header and enqueues `(urgency, arrival)`; a single
//! long-lived worker drains the queue and spawns the base handler per
//! request. This gives cooperative head-of-line ordering within a
//! connection; interleaving between live streams is the transport
//! scheduler's business.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use h3::error::ErrorLevel;
use http::Request;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use qprism_common::eps;

use super::{handle_request, ServerStream};
use crate::mbtiles::MbtilesSource;
use crate::metrics;

/// One admitted-but-not-yet-served request.
struct QueuedRequest {
    urgency: u8,
    /// Monotonic arrival counter; first come first served among equals.
    seq: u64,
    req: Request<()>,
    stream: ServerStream,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.urgency == other.urgency && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse both keys so the smallest
        // (urgency, seq) pair pops first
        other
            .urgency
            .cmp(&self.urgency)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: BinaryHeap<QueuedRequest>,
    next_seq: u64,
    closed: bool,
}

/// Admission queue shared between the accept loop and the worker.
#[derive(Clone)]
struct AdmissionQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl AdmissionQueue {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&self, urgency: u8, req: Request<()>, stream: ServerStream) {
        let mut inner = self.inner.lock();
        if inner.closed {
            // connection is tearing down; dropping the stream resets it
            return;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueuedRequest {
            urgency,
            seq,
            req,
            stream,
        });
        drop(inner);
        self.notify.notify_one();
    }

    /// Pop the most urgent request, waiting if the queue is empty.
    /// Returns `None` once the queue is closed and drained.
    async fn pop(&self) -> Option<QueuedRequest> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(queued) = inner.heap.pop() {
                    return Some(queued);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }
}

pub(crate) async fn serve_streams(
    mut conn: h3::server::Connection<h3_quinn::Connection, Bytes>,
    tiles: MbtilesSource,
    shutdown: CancellationToken,
) -> Result<()> {
    let queue = AdmissionQueue::new();
    let conn_cancel = shutdown.child_token();
    let worker = tokio::spawn(worker_loop(queue.clone(), tiles, conn_cancel.clone()));

    loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => break,
            accepted = conn.accept() => match accepted {
                Ok(Some((req, stream))) => {
                    let urgency = req
                        .headers()
                        .get("priority")
                        .and_then(|v| v.to_str().ok())
                        .map(eps::parse_urgency)
                        .unwrap_or(eps::DEFAULT_URGENCY);
                    metrics::request_admitted(urgency);
                    queue.push(urgency, req, stream);
                    metrics::admission_queue_depth(queue.len());
                }
                Ok(None) => break,
                Err(err) => match err.get_error_level() {
                    ErrorLevel::ConnectionError => break,
                    ErrorLevel::StreamError => continue,
                },
            },
        }
    }
    queue.close();
    conn_cancel.cancel();
    let _ = worker.await;
    Ok(())
}

/// Drain the queue in `(urgency, arrival)` order, spawning the base
/// handler per request. A stream reset while queued fails its first
/// header write, so a dead request is skipped without a byte hitting
/// the wire.
async fn worker_loop(queue: AdmissionQueue, tiles: MbtilesSource, cancel: CancellationToken) {
    let mut tasks = JoinSet::new();
    while let Some(queued) = queue.pop().await {
        while tasks.try_join_next().is_some() {}
        metrics::admission_queue_depth(queue.len());
        let tiles = tiles.clone();
        let cancel = cancel.clone();
        tasks.spawn(handle_request(queued.req, queued.stream, tiles, cancel));
    }
    tasks.shutdown().await;
}
