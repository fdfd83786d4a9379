//! Prometheus metrics for the send endpoint

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Upper bounds of the duration histogram, in milliseconds
pub const DURATION_BUCKETS_MS: [f64; 8] = [10.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Labels {
    route: String,
    method: String,
    status: u16,
}

impl Labels {
    fn render(&self) -> String {
        format!(
            "route=\"{}\",method=\"{}\",status=\"{}\"",
            self.route, self.method, self.status
        )
    }
}

#[derive(Debug, Default, Clone)]
struct Series {
    count: u64,
    sum_ms: f64,
    /// Non-cumulative counts per bucket, plus one overflow slot
    buckets: [u64; DURATION_BUCKETS_MS.len() + 1],
}

impl Series {
    fn observe(&mut self, ms: f64) {
        self.count += 1;
        self.sum_ms += ms;
        let slot = DURATION_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.buckets[slot] += 1;
    }
}

/// Request counters and latency histogram
pub struct Metrics {
    series: Mutex<BTreeMap<Labels, Series>>,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            series: Mutex::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record one finished request
    pub fn observe(&self, route: &str, method: &str, status: u16, elapsed: Duration) {
        let labels = Labels {
            route: route.to_string(),
            method: method.to_string(),
            status,
        };
        let ms = elapsed.as_secs_f64() * 1000.0;

        self.series
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(labels)
            .or_default()
            .observe(ms);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Number of requests recorded for a label set
    pub fn request_count(&self, route: &str, method: &str, status: u16) -> u64 {
        let labels = Labels {
            route: route.to_string(),
            method: method.to_string(),
            status,
        };
        self.series
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&labels)
            .map_or(0, |s| s.count)
    }

    /// Format metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let series = self
            .series
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut out = String::new();

        out.push_str("# HELP api_requests_total Total API requests\n");
        out.push_str("# TYPE api_requests_total counter\n");
        for (labels, s) in &series {
            let _ = writeln!(out, "api_requests_total{{{}}} {}", labels.render(), s.count);
        }

        out.push_str("\n# HELP api_request_duration_ms Request duration\n");
        out.push_str("# TYPE api_request_duration_ms histogram\n");
        for (labels, s) in &series {
            let rendered = labels.render();
            let mut cumulative = 0;
            for (bound, count) in DURATION_BUCKETS_MS.iter().zip(s.buckets.iter()) {
                cumulative += count;
                let _ = writeln!(
                    out,
                    "api_request_duration_ms_bucket{{{},le=\"{}\"}} {}",
                    rendered, bound, cumulative
                );
            }
            let _ = writeln!(
                out,
                "api_request_duration_ms_bucket{{{},le=\"+Inf\"}} {}",
                rendered, s.count
            );
            let _ = writeln!(out, "api_request_duration_ms_sum{{{}}} {}", rendered, s.sum_ms);
            let _ = writeln!(out, "api_request_duration_ms_count{{{}}} {}", rendered, s.count);
        }

        out.push_str("\n# HELP process_uptime_seconds Process uptime in seconds\n");
        out.push_str("# TYPE process_uptime_seconds gauge\n");
        let _ = writeln!(out, "process_uptime_seconds {}", self.uptime().as_secs());

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
