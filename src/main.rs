//! `repsvr` binary entry point: loads configuration and the peer
//! registry, ingests the antenna's inject file, and runs the replicator
//! until the simulated duration elapses, then dumps the converged store.
//!
//! Grounded on `examples/original_source/src/repsvr_main.cpp`'s thread
//! lifecycle (spawn ingest + replication, sleep for the sim duration,
//! shutdown, join, final CSV dump) and the teacher's `main.rs` tracing
//! init pattern.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use repsvr::config::Config;
use repsvr::log::PeerLog;
use repsvr::plot::{PlotStore, FLAG_NEW};
use repsvr::queue::QueueManager;
use repsvr::registry::{load_whitelist, PeerRegistry};
use repsvr::replicator::{Replicator, Shutdown};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_directive()))
        .init();

    let peers = PeerRegistry::load(&config.servers_file, config.ip, config.port)
        .context("loading peer registry")?;
    peers
        .validate_contiguous_node_ids(config.node_count)
        .context("validating peer registry")?;
    let key = repsvr::crypto::load_key(&config.key_file).context("loading shared key")?;
    let whitelist: HashSet<_> = load_whitelist(&config.whitelist_file).context("loading whitelist")?;

    let log = PeerLog::open(&peers.local_id).context("opening per-peer log file")?;
    log.write_line(&format!("node {} binding to {}:{}", peers.local_id, config.ip, config.port));

    let store = PlotStore::new();

    let queue = QueueManager::bind(config.ip, config.port, whitelist, peers.local_id.clone(), key)
        .await
        .context("binding listening socket")?;

    let mut replicator = Replicator::new(
        store.clone(),
        queue,
        peers,
        config.reference_node,
        config.time_mult,
        log,
    );

    let shutdown = Shutdown::new();
    let run_shutdown = shutdown.clone();
    let duration = Duration::from_secs(config.duration);

    // Ingest runs as its own task alongside the replicator (spec §5): the
    // antenna's inject file is loaded and flagged NEW concurrently with
    // whatever the replicator is already doing to the store, under the
    // store's single-writer-per-mutation lock rather than a pre-step.
    let ingest_store = store.clone();
    let sim_data = config.sim_data.clone();
    let ingest_task = tokio::spawn(async move {
        ingest_store
            .load_binary(&sim_data)
            .context("loading antenna inject file")?;
        ingest_store.with_records_mut(|records| {
            for r in records.iter_mut() {
                r.set_flags(FLAG_NEW);
            }
        });
        anyhow::Ok(())
    });

    let replicator_task = tokio::spawn(async move {
        replicator.run(duration, &run_shutdown).await;
        replicator
    });

    tokio::time::sleep(duration.div_f32(config.time_mult.max(f32::EPSILON))).await;
    shutdown.signal();

    let (ingest_result, replicator) = tokio::try_join!(ingest_task, replicator_task)
        .context("joining ingest and replicator tasks")?;
    ingest_result.context("ingest task failed")?;
    drop(replicator);

    tracing::info!("writing results to {}", config.outfile.display());
    store.sort_by_time();
    store.write_csv(&config.outfile).context("writing output CSV")?;

    Ok(())
}
