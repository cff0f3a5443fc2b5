//! In-memory request metrics and Prometheus exposition.
//!
//! One global collector, sharded counters keyed by provider and model,
//! and a fixed latency histogram. The `/metrics` endpoint renders the
//! whole thing in Prometheus text format.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Upper bounds of the latency histogram buckets, in milliseconds.
const LATENCY_BUCKETS_MS: [u64; 8] = [10, 50, 100, 250, 500, 1000, 5000, 30000];

#[derive(Default)]
struct CounterSet {
    total: AtomicU64,
    errors: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

pub struct Metrics {
    started_at: Instant,
    requests_total: AtomicU64,
    requests_errored: AtomicU64,
    by_provider: DashMap<String, CounterSet>,
    by_model: DashMap<String, CounterSet>,
    latency_buckets: [AtomicU64; 8],
    latency_sum_ms: AtomicU64,
    active_streams: AtomicU64,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| Metrics {
        started_at: Instant::now(),
        requests_total: AtomicU64::new(0),
        requests_errored: AtomicU64::new(0),
        by_provider: DashMap::new(),
        by_model: DashMap::new(),
        latency_buckets: Default::default(),
        latency_sum_ms: AtomicU64::new(0),
        active_streams: AtomicU64::new(0),
    })
}

/// Everything one request contributes.
#[derive(Debug, Clone, Default)]
pub struct RequestRecord {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub attempt: u32,
    pub success: bool,
    pub latency: Duration,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Metrics {
    pub fn record_request(&self, record: &RequestRecord) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !record.success {
            self.requests_errored.fetch_add(1, Ordering::Relaxed);
        }

        let latency_ms = record.latency.as_millis() as u64;
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if latency_ms <= *bound {
                self.latency_buckets[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }

        for (map, key) in [
            (&self.by_provider, record.provider.as_deref()),
            (&self.by_model, record.model.as_deref()),
        ] {
            if let Some(key) = key {
                let set = map.entry(key.to_string()).or_default();
                set.total.fetch_add(1, Ordering::Relaxed);
                if !record.success {
                    set.errors.fetch_add(1, Ordering::Relaxed);
                }
                set.input_tokens
                    .fetch_add(record.input_tokens, Ordering::Relaxed);
                set.output_tokens
                    .fetch_add(record.output_tokens, Ordering::Relaxed);
            }
        }
    }

    pub fn stream_started(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_finished(&self) {
        let current = self.active_streams.load(Ordering::Relaxed);
        if current > 0 {
            self.active_streams.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Render the Prometheus text exposition.
    pub fn render_prometheus(
        &self,
        breakers: &[crossbar_adapters::breaker::BreakerSnapshot],
    ) -> String {
        use std::fmt::Write;

        let mut out = String::with_capacity(4096);
        let total = self.requests_total.load(Ordering::Relaxed);
        let errored = self.requests_errored.load(Ordering::Relaxed);

        let _ = writeln!(out, "# TYPE crossbar_requests_total counter");
        let _ = writeln!(out, "crossbar_requests_total {total}");
        let _ = writeln!(out, "# TYPE crossbar_requests_errored_total counter");
        let _ = writeln!(out, "crossbar_requests_errored_total {errored}");
        let _ = writeln!(out, "# TYPE crossbar_uptime_seconds gauge");
        let _ = writeln!(out, "crossbar_uptime_seconds {}", self.uptime().as_secs());
        let _ = writeln!(out, "# TYPE crossbar_active_streams gauge");
        let _ = writeln!(
            out,
            "crossbar_active_streams {}",
            self.active_streams.load(Ordering::Relaxed)
        );

        let _ = writeln!(out, "# TYPE crossbar_request_duration_ms histogram");
        let mut cumulative = 0u64;
        for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            cumulative += self.latency_buckets[i].load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "crossbar_request_duration_ms_bucket{{le=\"{bound}\"}} {cumulative}"
            );
        }
        let _ = writeln!(
            out,
            "crossbar_request_duration_ms_bucket{{le=\"+Inf\"}} {total}"
        );
        let _ = writeln!(
            out,
            "crossbar_request_duration_ms_sum {}",
            self.latency_sum_ms.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "crossbar_request_duration_ms_count {total}");

        let _ = writeln!(out, "# TYPE crossbar_provider_requests_total counter");
        for entry in self.by_provider.iter() {
            let _ = writeln!(
                out,
                "crossbar_provider_requests_total{{provider=\"{}\"}} {}",
                entry.key(),
                entry.value().total.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "crossbar_provider_errors_total{{provider=\"{}\"}} {}",
                entry.key(),
                entry.value().errors.load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(out, "# TYPE crossbar_model_tokens_total counter");
        for entry in self.by_model.iter() {
            let _ = writeln!(
                out,
                "crossbar_model_tokens_total{{model=\"{}\",direction=\"input\"}} {}",
                entry.key(),
                entry.value().input_tokens.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "crossbar_model_tokens_total{{model=\"{}\",direction=\"output\"}} {}",
                entry.key(),
                entry.value().output_tokens.load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(out, "# TYPE crossbar_breaker_state gauge");
        for snapshot in breakers {
            let value = match snapshot.state {
                crossbar_adapters::breaker::BreakerState::Closed => 0,
                crossbar_adapters::breaker::BreakerState::HalfOpen => 1,
                crossbar_adapters::breaker::BreakerState::Open => 2,
            };
            let _ = writeln!(
                out,
                "crossbar_breaker_state{{provider=\"{}\"}} {value}",
                snapshot.provider_id
            );
        }

        out
    }
}
