//! Minimal metrics scaffolding.
//! Process-wide counters for publishes, chunk transfers and negotiation rounds;
//! surfaced by the `status` subcommand and read directly in tests.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static PUBLISH_SENT: AtomicU64 = AtomicU64::new(0);
static PUBLISH_ACKED: AtomicU64 = AtomicU64::new(0);
static PUBLISH_FAILED: AtomicU64 = AtomicU64::new(0);
static PUBLISH_RETRIES: AtomicU64 = AtomicU64::new(0);
static PUBLISH_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static PUBLISH_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);
static CHUNKS_SENT: AtomicU64 = AtomicU64::new(0);
static CHUNKS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static CHUNK_RETRIES: AtomicU64 = AtomicU64::new(0);
static ROUNDS_STARTED: AtomicU64 = AtomicU64::new(0);
static ROUNDS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static TRANSFERS_ABANDONED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_DEDUPED: AtomicU64 = AtomicU64::new(0);

pub fn inc_publish_sent() {
    PUBLISH_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_publish_acked() {
    PUBLISH_ACKED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_publish_failed() {
    PUBLISH_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_publish_retries() {
    PUBLISH_RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn observe_publish_latency(sent_at: Instant) {
    let ms = sent_at.elapsed().as_millis() as u64;
    PUBLISH_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    PUBLISH_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_chunks_sent() {
    CHUNKS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_chunks_received() {
    CHUNKS_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_chunk_retries() {
    CHUNK_RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_rounds_started() {
    ROUNDS_STARTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_rounds_completed() {
    ROUNDS_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transfers_abandoned() {
    TRANSFERS_ABANDONED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_requests_deduped() {
    REQUESTS_DEDUPED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct Snapshot {
    pub publish_sent: u64,
    pub publish_acked: u64,
    pub publish_failed: u64,
    pub publish_retries: u64,
    pub publish_latency_avg_ms: Option<u64>,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub chunk_retries: u64,
    pub rounds_started: u64,
    pub rounds_completed: u64,
    pub transfers_abandoned: u64,
    pub requests_deduped: u64,
}

pub fn snapshot() -> Snapshot {
    let sum = PUBLISH_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = PUBLISH_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        publish_sent: PUBLISH_SENT.load(Ordering::Relaxed),
        publish_acked: PUBLISH_ACKED.load(Ordering::Relaxed),
        publish_failed: PUBLISH_FAILED.load(Ordering::Relaxed),
        publish_retries: PUBLISH_RETRIES.load(Ordering::Relaxed),
        publish_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
        chunks_sent: CHUNKS_SENT.load(Ordering::Relaxed),
        chunks_received: CHUNKS_RECEIVED.load(Ordering::Relaxed),
        chunk_retries: CHUNK_RETRIES.load(Ordering::Relaxed),
        rounds_started: ROUNDS_STARTED.load(Ordering::Relaxed),
        rounds_completed: ROUNDS_COMPLETED.load(Ordering::Relaxed),
        transfers_abandoned: TRANSFERS_ABANDONED.load(Ordering::Relaxed),
        requests_deduped: REQUESTS_DEDUPED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        // Counters are process-global and other tests bump them concurrently,
        // so assert lower bounds rather than exact deltas.
        let before = snapshot();
        inc_publish_sent();
        inc_publish_retries();
        inc_chunks_received();
        let after = snapshot();
        assert!(after.publish_sent >= before.publish_sent + 1);
        assert!(after.publish_retries >= before.publish_retries + 1);
        assert!(after.chunks_received >= before.chunks_received + 1);
    }

    #[test]
    fn latency_average_present_after_observation() {
        observe_publish_latency(Instant::now());
        let snap = snapshot();
        assert!(snap.publish_latency_avg_ms.is_some());
    }
}
