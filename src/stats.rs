//! Atomic counters plus a periodic snapshot writer, grounded on the
//! original tool's stats file: fixed keys, derived RPS/ratio metrics
//! computed at write time from the deltas since the previous tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;

#[derive(Default)]
pub struct Stats {
    active_connections: AtomicU64,
    http_requests: AtomicU64,
    modified_requests: AtomicU64,
    cache_hit_modify: AtomicU64,
    cache_hit_pass: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_active(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_http_requests(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_modified(&self) {
        self.modified_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hit_modify(&self) {
        self.cache_hit_modify.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hit_pass(&self) {
        self.cache_hit_pass.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            http_requests: self.http_requests.load(Ordering::Relaxed),
            modified_requests: self.modified_requests.load(Ordering::Relaxed),
            cache_hit_modify: self.cache_hit_modify.load(Ordering::Relaxed),
            cache_hit_pass: self.cache_hit_pass.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy)]
struct Snapshot {
    active_connections: u64,
    http_requests: u64,
    modified_requests: u64,
    cache_hit_modify: u64,
    cache_hit_pass: u64,
}

/// Formats one stats-file body from the current snapshot and the deltas
/// since the previous tick. Exposed standalone so the formula can be
/// exercised without going through the timer loop.
fn render(snap: Snapshot, requests_since_last: u64, interval_secs: f64) -> String {
    let rps = if interval_secs > 0.0 {
        requests_since_last as f64 / interval_secs
    } else {
        0.0
    };

    let total_cache_hits = snap.cache_hit_modify + snap.cache_hit_pass;
    let rule_processing = snap.http_requests.saturating_sub(total_cache_hits);
    let direct_passthrough = snap.http_requests.saturating_sub(snap.modified_requests);
    let total_cache_ratio = if snap.http_requests > 0 {
        (total_cache_hits as f64 * 100.0) / snap.http_requests as f64
    } else {
        0.0
    };

    format!(
        "current_connections:{}\n\
         total_requests:{}\n\
         rps:{:.2}\n\
         successful_modifications:{}\n\
         direct_passthrough:{}\n\
         rule_processing:{}\n\
         cache_hit_modify:{}\n\
         cache_hit_pass:{}\n\
         total_cache_ratio:{:.2}\n",
        snap.active_connections,
        snap.http_requests,
        rps,
        snap.modified_requests,
        direct_passthrough,
        rule_processing,
        snap.cache_hit_modify,
        snap.cache_hit_pass,
        total_cache_ratio,
    )
}

/// Spawns the periodic writer task. Returns its `JoinHandle` so the caller
/// can abort it on shutdown.
pub fn spawn_writer(stats: Arc<Stats>, path: String, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        let mut last_requests = 0u64;
        let mut last_tick = Instant::now();
        loop {
            ticker.tick().await;
            let snap = stats.snapshot();
            let now = Instant::now();
            let interval_secs = now.duration_since(last_tick).as_secs_f64();
            let requests_since_last = snap.http_requests.saturating_sub(last_requests);
            last_requests = snap.http_requests;
            last_tick = now;

            let body = render(snap, requests_since_last, interval_secs);
            if let Err(err) = tokio::fs::write(&path, body).await {
                log::warn!("failed to write stats file {path}: {err}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_with_no_requests_has_zero_ratio() {
        let snap = Snapshot {
            active_connections: 0,
            http_requests: 0,
            modified_requests: 0,
            cache_hit_modify: 0,
            cache_hit_pass: 0,
        };
        let body = render(snap, 0, 1.0);
        assert!(body.contains("total_cache_ratio:0.00"));
        assert!(body.contains("rps:0.00"));
    }

    #[test]
    fn render_computes_expected_derived_metrics() {
        let snap = Snapshot {
            active_connections: 3,
            http_requests: 100,
            modified_requests: 40,
            cache_hit_modify: 20,
            cache_hit_pass: 10,
        };
        let body = render(snap, 50, 5.0);
        assert!(body.contains("current_connections:3"));
        assert!(body.contains("total_requests:100"));
        assert!(body.contains("rps:10.00"));
        assert!(body.contains("successful_modifications:40"));
        assert!(body.contains("direct_passthrough:60"));
        assert!(body.contains("rule_processing:70"));
        assert!(body.contains("cache_hit_modify:20"));
        assert!(body.contains("cache_hit_pass:10"));
        assert!(body.contains("total_cache_ratio:30.00"));
    }

    #[test]
    fn render_never_underflows_when_modified_exceeds_requests() {
        let snap = Snapshot {
            active_connections: 0,
            http_requests: 5,
            modified_requests: 9,
            cache_hit_modify: 9,
            cache_hit_pass: 0,
        };
        let body = render(snap, 0, 1.0);
        assert!(body.contains("direct_passthrough:0"));
        assert!(body.contains("rule_processing:0"));
    }
}
