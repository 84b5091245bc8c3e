use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::CacheStats;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    /// Keyed by `<scope>/<uid>`, e.g. `suts/gpt-4o`.
    pub targets: BTreeMap<String, TargetMetrics>,
    pub caches: BTreeMap<String, CacheStats>,
    pub total_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct TargetMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_call(&self, scope: &str, uid: &str) -> CallTimer {
        CallTimer {
            target: format!("{scope}/{uid}"),
            started_at: Instant::now(),
            collector: Arc::clone(&self.inner),
            failed: false,
        }
    }

    pub fn record_cache_stats(&self, scope: &str, uid: &str, stats: CacheStats) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = guard.caches.entry(format!("{scope}/{uid}")).or_default();
        entry.hits += stats.hits;
        entry.misses += stats.misses;
    }

    pub fn record_total_duration(&self, duration: Duration) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total_duration_ms += duration.as_secs_f64() * 1_000.0;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Records one target call when dropped. A call is counted as failed if
/// [`CallTimer::mark_failed`] was called or the thread is unwinding.
pub struct CallTimer {
    target: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    failed: bool,
}

impl CallTimer {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        let failed = self.failed || thread::panicking();
        {
            let mut guard = self.collector.lock().unwrap_or_else(PoisonError::into_inner);
            let metrics = guard.targets.entry(self.target.clone()).or_default();
            metrics.calls += 1;
            if failed {
                metrics.failures += 1;
            }
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            target_uid = self.target.as_str(),
            duration_ms,
            failed,
            "Target call recorded"
        );
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        target_count = snapshot.targets.len(),
        "Run metrics summary"
    );
    for (target, metrics) in &snapshot.targets {
        info!(
            target_uid = target.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Target metrics"
        );
    }
    for (cache, stats) in &snapshot.caches {
        info!(
            cache = cache.as_str(),
            hits = stats.hits,
            misses = stats.misses,
            "Cache metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP evalrig_target_calls_total Target invocation count\n");
        output.push_str("# TYPE evalrig_target_calls_total counter\n");
        output.push_str("# HELP evalrig_target_failures_total Target invocations that failed\n");
        output.push_str("# TYPE evalrig_target_failures_total counter\n");
        output.push_str(
            "# HELP evalrig_target_duration_seconds_total Accumulated target call duration in seconds\n",
        );
        output.push_str("# TYPE evalrig_target_duration_seconds_total counter\n");
        output.push_str(
            "# HELP evalrig_target_duration_seconds_max Maximum target call duration in seconds\n",
        );
        output.push_str("# TYPE evalrig_target_duration_seconds_max gauge\n");
        for (target, metrics) in &self.targets {
            let _ = writeln!(
                output,
                "evalrig_target_calls_total{{target=\"{}\"}} {}",
                target, metrics.calls
            );
            let _ = writeln!(
                output,
                "evalrig_target_failures_total{{target=\"{}\"}} {}",
                target, metrics.failures
            );
            let _ = writeln!(
                output,
                "evalrig_target_duration_seconds_total{{target=\"{}\"}} {:.6}",
                target,
                metrics.total_duration_ms / 1_000.0
            );
            let _ = writeln!(
                output,
                "evalrig_target_duration_seconds_max{{target=\"{}\"}} {:.6}",
                target,
                metrics.max_duration_ms / 1_000.0
            );
        }
        output.push_str("# HELP evalrig_cache_hits_total Response cache hits\n");
        output.push_str("# TYPE evalrig_cache_hits_total counter\n");
        output.push_str("# HELP evalrig_cache_misses_total Response cache misses\n");
        output.push_str("# TYPE evalrig_cache_misses_total counter\n");
        for (cache, stats) in &self.caches {
            let _ = writeln!(
                output,
                "evalrig_cache_hits_total{{cache=\"{}\"}} {}",
                cache, stats.hits
            );
            let _ = writeln!(
                output,
                "evalrig_cache_misses_total{{cache=\"{}\"}} {}",
                cache, stats.misses
            );
        }
        output.push_str("# HELP evalrig_run_duration_seconds Total run duration\n");
        output.push_str("# TYPE evalrig_run_duration_seconds gauge\n");
        let _ = writeln!(
            output,
            "evalrig_run_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_calls_and_failures() {
        let metrics = MetricsCollector::new();
        drop(metrics.start_call("suts", "a"));
        let mut failing = metrics.start_call("suts", "a");
        failing.mark_failed();
        drop(failing);

        let snapshot = metrics.snapshot();
        let target = &snapshot.targets["suts/a"];
        assert_eq!(target.calls, 2);
        assert_eq!(target.failures, 1);
    }

    #[test]
    fn prometheus_output_labels_targets() {
        let metrics = MetricsCollector::new();
        drop(metrics.start_call("annotators", "kw"));
        metrics.record_cache_stats("annotators", "kw", CacheStats { hits: 3, misses: 1 });

        let text = metrics.snapshot().to_prometheus();
        assert!(text.contains("evalrig_target_calls_total{target=\"annotators/kw\"} 1"));
        assert!(text.contains("evalrig_cache_hits_total{cache=\"annotators/kw\"} 3"));
    }
}
