//! The experiment driver: boots a server for the configured variant,
//! walks the trace against the wall clock, drives the scheduler each
//! frame, dispatches and cancels fetches, and records every event.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use qprism_common::eps::eps_from_ring;
use qprism_common::types::{
    parse_tile_id, SchedulerVariant, Tile, TileCompletion, TileKey, TileRequest,
};
use qprism_transport::http2::{self, H2Server};
use qprism_transport::mbtiles::MbtilesSource;
use qprism_transport::server::{serve, ShimKind, TileServer};
use qprism_transport::client;

use crate::completeness::compute_completeness;
use crate::config::{BaseConfig, ExperimentConfig};
use crate::geometry::{ring_enum, viewport_from_visible, visible_tile_coords};
use crate::netem::{self, NetemProfile};
use crate::scheduler::{scheduler_for, SchedulePolicy};
use crate::sink::EventSink;
use crate::trace::{load_trace, TracePoint};
use crate::metrics;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub interface: String,
    pub host: String,
    pub port: u16,
    pub mbtiles: Option<PathBuf>,
    pub apply_netem: bool,
    pub dry_netem: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            interface: "lo".into(),
            host: "127.0.0.1".into(),
            port: 4433,
            mbtiles: None,
            apply_netem: true,
            dry_netem: false,
        }
    }
}

/// Run every configured repetition of one experiment.
pub async fn run_experiment(
    base: &BaseConfig,
    exp: &ExperimentConfig,
    opts: &RunOptions,
) -> Result<()> {
    let profiles = netem::load_profiles(&base.netem_profiles)?;
    let profile = profiles
        .get(&exp.netem_profile)
        .with_context(|| format!("unknown netem profile: {}", exp.netem_profile))?;

    let tiles_path = base.tile_source(opts.mbtiles.as_deref());
    ensure!(
        tiles_path.is_file(),
        "MBTiles not found: {}",
        tiles_path.display()
    );

    let trace_path = exp.trace_path(base);
    let trace = load_trace(&trace_path)?;
    ensure!(!trace.is_empty(), "trace is empty: {}", trace_path.display());

    let sink = EventSink::open(&base.results_db_path)?;

    for run_idx in 0..exp.runs {
        run_once(base, exp, opts, profile, &tiles_path, &trace, &sink, run_idx).await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_once(
    base: &BaseConfig,
    exp: &ExperimentConfig,
    opts: &RunOptions,
    profile: &NetemProfile,
    tiles_path: &Path,
    trace: &[TracePoint],
    sink: &EventSink,
    run_idx: u32,
) -> Result<()> {
    tracing::info!(run = run_idx, variant = %exp.scheduler_variant, "starting run");

    if opts.apply_netem {
        if opts.dry_netem {
            tracing::info!(cmd = ?netem::apply_command(profile, &opts.interface), "dry-run netem apply");
        } else {
            netem::apply(profile, &opts.interface).await?;
        }
    }

    let result = run_once_inner(base, exp, opts, tiles_path, trace, sink, run_idx).await;

    // teardown failures are logged, never allowed to mask the run result
    if opts.apply_netem {
        if opts.dry_netem {
            tracing::info!(cmd = ?netem::clear_command(&opts.interface), "dry-run netem clear");
        } else if let Err(e) = netem::clear(&opts.interface).await {
            tracing::warn!(error = %e, "failed to clear netem profile");
        }
    }
    result
}

async fn run_once_inner(
    base: &BaseConfig,
    exp: &ExperimentConfig,
    opts: &RunOptions,
    tiles_path: &Path,
    trace: &[TracePoint],
    sink: &EventSink,
    run_idx: u32,
) -> Result<()> {
    let server = boot_server(exp.scheduler_variant, base, opts, tiles_path).await?;
    let run_id = sink.log_run(exp, run_idx)?;
    let mut scheduler = scheduler_for(exp.scheduler_variant);
    let mut rng = StdRng::seed_from_u64(exp.seed_base + u64::from(run_idx));

    let target = server.target(&opts.host);
    let outcome = walk_trace(
        trace,
        &mut scheduler,
        exp.scheduler_variant,
        &target,
        run_id,
        sink,
        &mut rng,
        Duration::from_secs(base.drain_timeout_s),
    )
    .await;
    server.shutdown().await;
    let completions = outcome?;

    let series = compute_completeness(trace, &completions);
    for (ts_ms, completeness) in &series {
        sink.log_viewport_sample(run_id, *ts_ms, *completeness)?;
    }
    tracing::info!(
        run = run_idx,
        completions = completions.len(),
        samples = series.len(),
        "run finished"
    );
    Ok(())
}

enum ServerContext {
    H2(H2Server),
    H3(TileServer),
}

/// Where fetch tasks should aim; cheap to clone into each task.
#[derive(Debug, Clone)]
enum FetchTarget {
    H2 { base_url: String },
    H3 { host: String, port: u16 },
}

impl ServerContext {
    fn target(&self, host: &str) -> FetchTarget {
        match self {
            ServerContext::H2(server) => FetchTarget::H2 {
                base_url: server.base_url(),
            },
            ServerContext::H3(server) => FetchTarget::H3 {
                host: host.to_string(),
                port: server.local_addr().port(),
            },
        }
    }

    async fn shutdown(self) {
        match self {
            ServerContext::H2(server) => server.shutdown(),
            ServerContext::H3(server) => server.shutdown().await,
        }
    }
}

async fn boot_server(
    variant: SchedulerVariant,
    base: &BaseConfig,
    opts: &RunOptions,
    tiles_path: &Path,
) -> Result<ServerContext> {
    let tiles = MbtilesSource::open(tiles_path)?;
    match variant {
        SchedulerVariant::Http2Default => {
            let addr = format!("{}:0", opts.host).parse().context("parse host")?;
            Ok(ServerContext::H2(http2::serve_h2(addr, tiles).await?))
        }
        SchedulerVariant::Http3Default => {
            let addr = format!("{}:{}", opts.host, opts.port)
                .parse()
                .context("parse host/port")?;
            let server = serve(
                ShimKind::Base,
                addr,
                &base.cert_path(),
                &base.key_path(),
                tiles,
            )
            .await?;
            Ok(ServerContext::H3(server))
        }
        _ => {
            let addr = format!("{}:{}", opts.host, opts.port)
                .parse()
                .context("parse host/port")?;
            let server = serve(
                ShimKind::Prioritized,
                addr,
                &base.cert_path(),
                &base.key_path(),
                tiles,
            )
            .await?;
            Ok(ServerContext::H3(server))
        }
    }
}

struct FetchHandle {
    cancel: CancellationToken,
}

#[allow(clippy::too_many_arguments)]
async fn walk_trace(
    trace: &[TracePoint],
    scheduler: &mut Option<Box<dyn SchedulePolicy>>,
    variant: SchedulerVariant,
    target: &FetchTarget,
    run_id: i64,
    sink: &EventSink,
    rng: &mut StdRng,
    drain_timeout: Duration,
) -> Result<Vec<TileCompletion>> {
    let t0 = Instant::now();
    let (done_tx, done_rx) = async_channel::unbounded::<TileCompletion>();
    let mut requested: FxHashSet<TileKey> = FxHashSet::default();
    let mut fetches: FxHashMap<TileKey, FetchHandle> = FxHashMap::default();
    let mut completions: Vec<TileCompletion> = Vec::new();

    for tp in trace {
        // pace the walk against the trace clock so completion times are
        // comparable with request times
        tokio::time::sleep_until(t0 + Duration::from_millis(tp.t_ms)).await;

        let visible = visible_tile_coords(tp.lat, tp.lon, tp.zoom);
        if visible.is_empty() {
            continue;
        }
        let viewport = viewport_from_visible(&visible, tp.zoom)?;
        let mut visible_tiles: Vec<Tile> = visible
            .iter()
            .map(|&(x, y)| Tile::new(x, y, tp.zoom))
            .collect();
        // shuffling exposes any accidental dependence on input order
        visible_tiles.shuffle(rng);

        let (to_load, to_cancel) = match scheduler.as_mut() {
            Some(policy) => policy.schedule(&viewport, &visible_tiles),
            None => (
                visible_tiles
                    .iter()
                    .filter(|tile| !requested.contains(&tile.key()))
                    .copied()
                    .collect(),
                Vec::new(),
            ),
        };

        for tile in &to_cancel {
            if let Some(handle) = fetches.get(&tile.key()) {
                handle.cancel.cancel();
            }
        }

        for tile in to_load {
            let key = tile.key();
            if !requested.insert(key) {
                // the policy re-admitted a tile this driver already fetched
                // to completion; hand it straight back so the tracker only
                // holds fetches that are actually pending
                if let Some(policy) = scheduler.as_mut() {
                    policy.on_completion(&tile);
                }
                continue;
            }
            let ring = ring_enum(&tile, &viewport);
            let request = TileRequest {
                tile_id: tile.id(),
                zoom: tile.z,
                ring,
                requested_at_ms: tp.t_ms,
                deadline_ms: None,
            };
            sink.log_tile_requested(run_id, &request)?;
            metrics::tile_requested(ring.as_u8());

            let cancel = CancellationToken::new();
            fetches.insert(key, FetchHandle {
                cancel: cancel.clone(),
            });
            tokio::spawn(fetch_and_report(
                tile,
                request,
                variant,
                target.clone(),
                cancel,
                done_tx.clone(),
                t0,
            ));
        }
        metrics::fetches_in_flight(fetches.len());

        while let Ok(completion) = done_rx.try_recv() {
            record_completion(completion, scheduler, &mut fetches, &mut completions, sink, run_id)?;
        }
        tokio::task::yield_now().await;
    }

    // bounded post-trace drain
    let deadline = Instant::now() + drain_timeout;
    while !fetches.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, done_rx.recv()).await {
            Ok(Ok(completion)) => {
                record_completion(completion, scheduler, &mut fetches, &mut completions, sink, run_id)?;
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }

    // whatever is still in flight is abandoned; its cancelled completion
    // keeps the request/completion pairing intact
    if !fetches.is_empty() {
        tracing::warn!(
            remaining = fetches.len(),
            "drain timed out; cancelling remaining fetches"
        );
        for handle in fetches.values() {
            handle.cancel.cancel();
        }
        while !fetches.is_empty() {
            match tokio::time::timeout(Duration::from_secs(5), done_rx.recv()).await {
                Ok(Ok(completion)) => {
                    record_completion(completion, scheduler, &mut fetches, &mut completions, sink, run_id)?;
                }
                Ok(Err(_)) | Err(_) => break,
            }
        }
    }
    metrics::fetches_in_flight(fetches.len());

    Ok(completions)
}

fn record_completion(
    completion: TileCompletion,
    scheduler: &mut Option<Box<dyn SchedulePolicy>>,
    fetches: &mut FxHashMap<TileKey, FetchHandle>,
    completions: &mut Vec<TileCompletion>,
    sink: &EventSink,
    run_id: i64,
) -> Result<()> {
    if let Some((x, y)) = parse_tile_id(&completion.tile_id) {
        let tile = Tile::new(x, y, completion.zoom);
        fetches.remove(&tile.key());
        if let Some(policy) = scheduler.as_mut() {
            policy.on_completion(&tile);
        }
    }
    if completion.cancelled {
        metrics::tile_cancelled(completion.ring.as_u8());
    } else {
        metrics::tile_completed(
            completion.ring.as_u8(),
            completion.bytes_transferred,
            completion.completed_at_ms - completion.requested_at_ms,
        );
    }
    sink.log_tile_completed(run_id, &completion)?;
    completions.push(completion);
    Ok(())
}

async fn fetch_and_report(
    tile: Tile,
    request: TileRequest,
    variant: SchedulerVariant,
    target: FetchTarget,
    cancel: CancellationToken,
    done: async_channel::Sender<TileCompletion>,
    t0: Instant,
) {
    let tile_path = format!("/tiles/{}/{}/{}.pbf", tile.z, tile.x, tile.y);
    let outcome = tokio::select! {
        _ = cancel.cancelled() => None,
        res = fetch_tile(&tile_path, variant, &target, &request) => Some(res),
    };
    let completed_at_ms = t0.elapsed().as_millis() as u64;
    let completion = match outcome {
        Some(Ok(body)) => TileCompletion {
            tile_id: request.tile_id,
            zoom: request.zoom,
            ring: request.ring,
            requested_at_ms: request.requested_at_ms,
            completed_at_ms: completed_at_ms.max(request.requested_at_ms),
            cancelled: false,
            bytes_transferred: body.len() as u64,
        },
        other => {
            if let Some(Err(e)) = other {
                tracing::warn!(error = %e, tile = %tile, "tile fetch failed");
                metrics::fetch_failed(request.ring.as_u8());
            }
            // failures and cancellations both terminate with an empty,
            // cancelled completion: the tile was not delivered
            TileCompletion {
                tile_id: request.tile_id,
                zoom: request.zoom,
                ring: request.ring,
                requested_at_ms: request.requested_at_ms,
                completed_at_ms: completed_at_ms.max(request.requested_at_ms),
                cancelled: true,
                bytes_transferred: 0,
            }
        }
    };
    let _ = done.send(completion).await;
}

async fn fetch_tile(
    tile_path: &str,
    variant: SchedulerVariant,
    target: &FetchTarget,
    request: &TileRequest,
) -> Result<Bytes> {
    match target {
        FetchTarget::H2 { base_url } => http2::fetch_tile_h2(base_url, tile_path).await,
        FetchTarget::H3 { host, port } => match variant {
            SchedulerVariant::Http3Default => client::fetch_tile_h3(host, *port, tile_path).await,
            _ => {
                client::fetch_tile_qprism(host, *port, tile_path, eps_from_ring(request.ring))
                    .await
            }
        },
    }
}
