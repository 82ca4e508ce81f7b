//! Replicator — the orchestration loop: drives the Queue Manager, batches
//! newly-ingested plots out to every peer every 20 adjusted-time seconds,
//! drains inbound batches into the store, and runs the deconfliction pass.
//!
//! Grounded on the teacher's `tokio::select!`-driven task loop in
//! `s2s.rs` (a `tokio::sync::Notify`-backed shutdown flag checked each
//! iteration) and the source's `ReplThread` main loop shape recovered from
//! `original_source/src/ReplServer.cpp`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::codec::{decode_batch, encode_batch};
use crate::log::PeerLog;
use crate::plot::{PlotRecord, PlotStore, FLAG_NEW, FLAG_SYNCD};
use crate::queue::QueueManager;
use crate::registry::PeerRegistry;

/// Max timestamp gap for two observations to be considered the same
/// physical event: 2 * max per-node skew (±3s) + 1.
const MATCH_WINDOW: i64 = 7;
/// Cadence of the "new plots" broadcast, in adjusted-time seconds.
const BROADCAST_INTERVAL: Duration = Duration::from_secs(20);
/// Idle sleep between loop iterations.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Shared, cloneable shutdown signal (spec §4.7): both the ingest task and
/// the replicator task observe it each iteration.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Replicator {
    store: Arc<PlotStore>,
    queue: QueueManager,
    peers: PeerRegistry,
    reference_node: u32,
    time_mult: f32,
    log: PeerLog,
    started: Instant,
    last_repl: Duration,
    last_seen_size: usize,
}

impl Replicator {
    pub fn new(
        store: Arc<PlotStore>,
        queue: QueueManager,
        peers: PeerRegistry,
        reference_node: u32,
        time_mult: f32,
        log: PeerLog,
    ) -> Self {
        Self {
            store,
            queue,
            peers,
            reference_node,
            time_mult,
            log,
            started: Instant::now(),
            last_repl: Duration::ZERO,
            last_seen_size: 0,
        }
    }

    fn adjusted_elapsed(&self) -> Duration {
        self.started.elapsed().mul_f32(self.time_mult)
    }

    /// Runs the loop (spec §4.6) until `shutdown` is signalled or
    /// `duration` adjusted-time seconds have elapsed.
    pub async fn run(&mut self, duration: Duration, shutdown: &Shutdown) {
        while !shutdown.is_set() && self.adjusted_elapsed() < duration {
            self.tick().await;
            tokio::time::sleep(IDLE_SLEEP).await;
        }
    }

    /// One pass of the loop body, exposed separately so tests can drive it
    /// deterministically without the idle sleep.
    pub async fn tick(&mut self) {
        self.queue.handle_queue(&self.log).await;

        if self.adjusted_elapsed() - self.last_repl > BROADCAST_INTERVAL {
            self.queue_new_plots();
            self.last_repl = self.adjusted_elapsed();
        }

        while let Some((_peer_id, payload)) = self.queue.pop(&self.peers, &self.log) {
            match decode_batch(&payload) {
                Ok(records) => {
                    for r in records {
                        self.store.add(r.drone_id, r.node_id, r.timestamp, r.latitude, r.longitude);
                    }
                }
                Err(e) => self.log.write_line(&format!("dropped malformed inbound batch: {e}")),
            }
        }

        self.deconfliction_pass();
    }

    fn queue_new_plots(&mut self) {
        let batch: Vec<PlotRecord> = self.store.with_records_mut(|records| {
            let mut batch = Vec::new();
            for r in records.iter_mut() {
                if r.is_flag_set(FLAG_NEW) {
                    batch.push(*r);
                    r.clear_flags(FLAG_NEW);
                }
            }
            batch
        });
        if !batch.is_empty() {
            let buf = encode_batch(&batch);
            self.queue.send_to_all(&self.peers, buf);
        }
    }

    fn deconfliction_pass(&mut self) {
        self.last_seen_size =
            run_deconfliction_pass(&self.store, self.reference_node, self.last_seen_size);
    }
}

/// The deconfliction pass (spec §4.6.1), as a free function over a store
/// reference so it can be driven directly from unit tests without a
/// `QueueManager`/socket. Returns the new `last_seen_size` watermark —
/// the store's size *after* the pass, since duplicate collapse shrinks it;
/// watermarking the pre-pass size would let later ingress backfill the gap
/// to a stale count and wrongly short-circuit the next pass.
fn run_deconfliction_pass(store: &PlotStore, reference_node: u32, last_seen_size: usize) -> usize {
    let size = store.size();
    if size <= last_seen_size {
        return last_seen_size;
    }

    store.with_records_mut(|records| {
        records.sort_by_key(|r| r.timestamp);

        let mut skew: HashMap<u32, i64> = HashMap::new();
        skew.insert(reference_node, 0);
        let mut pair_skew: HashMap<(u32, u32), i64> = HashMap::new();

        let mut i = 0;
        while i < records.len() {
            let mut j = i + 1;
            while j < records.len() {
                if records_match(&records[i], &records[j]) {
                    record_skew_observation(&mut skew, &mut pair_skew, reference_node, records[i], records[j]);
                    records.remove(j);
                    continue;
                }
                j += 1;
            }
            i += 1;
        }

        infer_missing_skews(&mut skew, &pair_skew);

        for r in records.iter_mut() {
            if !r.is_flag_set(FLAG_SYNCD) {
                if let Some(&s) = skew.get(&r.node_id) {
                    r.timestamp -= s;
                    r.set_flags(FLAG_SYNCD);
                }
            }
        }

        records.len()
    })
}

fn records_match(a: &PlotRecord, b: &PlotRecord) -> bool {
    a.drone_id == b.drone_id
        && a.latitude == b.latitude
        && a.longitude == b.longitude
        && a.node_id != b.node_id
        && (a.timestamp - b.timestamp).abs() < MATCH_WINDOW
}

/// Records a skew observation for a matched pair `(earlier, later)` in
/// sorted-by-timestamp order. `skew[n] = timestamp(n) - timestamp(reference)`
/// at match time; see DESIGN.md for why this sign convention was chosen
/// over the spec's worked example, which used an inconsistent one.
fn record_skew_observation(
    skew: &mut HashMap<u32, i64>,
    pair_skew: &mut HashMap<(u32, u32), i64>,
    reference_node: u32,
    earlier: PlotRecord,
    later: PlotRecord,
) {
    if earlier.node_id == reference_node {
        skew.entry(later.node_id).or_insert(later.timestamp - earlier.timestamp);
    } else if later.node_id == reference_node {
        skew.entry(earlier.node_id).or_insert(earlier.timestamp - later.timestamp);
    } else {
        pair_skew
            .entry((earlier.node_id, later.node_id))
            .or_insert(earlier.timestamp - later.timestamp);
    }
}

/// Fixed-point cross-pair inference (spec §4.6.1c, generalized beyond the
/// three-node worked example to any chain of pairwise observations).
fn infer_missing_skews(skew: &mut HashMap<u32, i64>, pair_skew: &HashMap<(u32, u32), i64>) {
    let mut progressed = true;
    while progressed {
        progressed = false;
        for (&(a, b), &ab) in pair_skew {
            match (skew.get(&a).copied(), skew.get(&b).copied()) {
                (Some(sa), None) => {
                    skew.insert(b, sa - ab);
                    progressed = true;
                }
                (None, Some(sb)) => {
                    skew.insert(a, ab + sb);
                    progressed = true;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skew_of(records: &mut [PlotRecord], reference_node: u32) -> HashMap<u32, i64> {
        records.sort_by_key(|r| r.timestamp);
        let mut skew: HashMap<u32, i64> = HashMap::new();
        skew.insert(reference_node, 0);
        let mut pair_skew: HashMap<(u32, u32), i64> = HashMap::new();
        let mut out = records.to_vec();
        let mut i = 0;
        while i < out.len() {
            let mut j = i + 1;
            while j < out.len() {
                if records_match(&out[i], &out[j]) {
                    record_skew_observation(&mut skew, &mut pair_skew, reference_node, out[i], out[j]);
                    out.remove(j);
                    continue;
                }
                j += 1;
            }
            i += 1;
        }
        infer_missing_skews(&mut skew, &pair_skew);
        skew
    }

    #[test]
    fn direct_reference_match_yields_skew() {
        let mut records = vec![
            PlotRecord::new(1, 1, 100, 0.0, 0.0),
            PlotRecord::new(1, 2, 102, 0.0, 0.0),
        ];
        let skew = skew_of(&mut records, 1);
        assert_eq!(skew[&2], 2);
    }

    #[test]
    fn cross_pair_inference_derives_missing_skew() {
        let mut records = vec![
            PlotRecord::new(1, 2, 50, 1.0, 1.0),
            PlotRecord::new(1, 3, 55, 1.0, 1.0),
            PlotRecord::new(2, 1, 200, 2.0, 2.0),
            PlotRecord::new(2, 3, 204, 2.0, 2.0),
        ];
        let skew = skew_of(&mut records, 1);
        assert_eq!(skew[&3], 4);
        assert_eq!(skew[&2], -1);
    }

    #[test]
    fn two_node_duplicate_collapses_and_aligns_timestamp() {
        let store = PlotStore::new();
        store.add(1, 1, 100, 0.0, 0.0);
        store.add(1, 2, 102, 0.0, 0.0);

        run_deconfliction_pass(&store, 1, 0);

        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].node_id, 1);
        assert_eq!(snap[0].timestamp, 100);
    }

    #[test]
    fn boundary_of_match_window_is_exclusive_at_seven() {
        let store = PlotStore::new();
        store.add(1, 1, 100, 0.0, 0.0);
        store.add(1, 2, 107, 0.0, 0.0); // |Δ| = 7, not a match
        run_deconfliction_pass(&store, 1, 0);
        assert_eq!(store.size(), 2);

        let store2 = PlotStore::new();
        store2.add(1, 1, 100, 0.0, 0.0);
        store2.add(1, 2, 106, 0.0, 0.0); // |Δ| = 6, matches
        run_deconfliction_pass(&store2, 1, 0);
        assert_eq!(store2.size(), 1);
    }

    #[test]
    fn idempotent_on_converged_store() {
        let store = PlotStore::new();
        store.add(1, 1, 100, 0.0, 0.0);
        store.add(1, 2, 102, 0.0, 0.0);
        let last_seen = run_deconfliction_pass(&store, 1, 0);
        let after_first = store.snapshot();

        run_deconfliction_pass(&store, 1, last_seen);
        let after_second = store.snapshot();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn watermark_reflects_post_pass_size_so_backfill_to_the_stale_count_still_runs() {
        let store = PlotStore::new();
        store.add(1, 1, 100, 0.0, 0.0);
        store.add(1, 2, 102, 0.0, 0.0);

        // Pre-pass size is 2; the pass collapses the duplicate pair down to
        // one record, so the correct watermark is 1, not the pre-pass 2.
        let watermark = run_deconfliction_pass(&store, 1, 0);
        assert_eq!(watermark, 1, "watermark must be the post-pass size, not the pre-pass size");
        assert_eq!(store.size(), 1);

        // Ingress backfills the store back up to the stale pre-pass count
        // (2) with a genuinely new, unsynced reference-node record. A
        // watermark of 2 (the old, pre-pass-size behavior) would wrongly
        // short-circuit the next pass via `size <= last_seen_size`, so this
        // record would never get FLAG_SYNCD; the correct post-pass
        // watermark of 1 lets the pass run and flag it.
        store.add(2, 1, 600, 5.0, 5.0);
        assert_eq!(store.size(), 2);

        run_deconfliction_pass(&store, 1, watermark);

        let snap = store.snapshot();
        let backfilled = snap.iter().find(|r| r.drone_id == 2).expect("backfilled record must still be present");
        assert!(backfilled.is_flag_set(FLAG_SYNCD), "backfilled record must have been deconflicted, not skipped");
    }

    #[test]
    fn reference_node_records_are_never_shifted() {
        let store = PlotStore::new();
        store.add(1, 1, 100, 0.0, 0.0);
        store.add(1, 2, 103, 0.0, 0.0);
        run_deconfliction_pass(&store, 1, 0);
        let snap = store.snapshot();
        assert_eq!(snap[0].node_id, 1);
        assert_eq!(snap[0].timestamp, 100);
    }
}
