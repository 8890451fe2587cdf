use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use seccloud_storage::{MetricsCollector, SharedMetrics};

lazy_static! {
    static ref REGISTRY: Registry =
        Registry::new_custom(Some("seccloud".to_string()), None).unwrap_or_default();
}

/// Prometheus backed collector, registered on the process wide registry.
#[derive(Clone)]
pub struct PrometheusMetrics {
    slices: IntCounterVec,
    slice_bytes: IntCounterVec,
    generations: IntCounter,
    cache_requests: IntCounterVec,
    evictions: IntCounter,
}

impl PrometheusMetrics {
    /// Creates and registers the counters. Fails when called twice.
    pub fn register() -> prometheus::Result<Self> {
        let metrics = Self {
            slices: IntCounterVec::new(
                Opts::new("slice_transfers_total", "Slice transfers by direction and result"),
                &["direction", "result"],
            )?,
            slice_bytes: IntCounterVec::new(
                Opts::new("slice_bytes_total", "Slice bytes sent to and received from stores"),
                &["direction"],
            )?,
            generations: IntCounter::new(
                "generations_committed_total",
                "Generations committed to the cloud stores",
            )?,
            cache_requests: IntCounterVec::new(
                Opts::new("cache_requests_total", "Content cache lookups by result"),
                &["result"],
            )?,
            evictions: IntCounter::new("cache_evictions_total", "Clean entries evicted")?,
        };

        REGISTRY.register(Box::new(metrics.slices.clone()))?;
        REGISTRY.register(Box::new(metrics.slice_bytes.clone()))?;
        REGISTRY.register(Box::new(metrics.generations.clone()))?;
        REGISTRY.register(Box::new(metrics.cache_requests.clone()))?;
        REGISTRY.register(Box::new(metrics.evictions.clone()))?;
        #[cfg(target_os = "linux")]
        REGISTRY.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(metrics)
    }

    pub fn shared(&self) -> SharedMetrics {
        SharedMetrics::new(Arc::new(self.clone()))
    }
}

impl MetricsCollector for PrometheusMetrics {
    fn slice_uploaded(&self, bytes: u64) {
        self.slices.with_label_values(&["upload", "ok"]).inc();
        self.slice_bytes.with_label_values(&["upload"]).inc_by(bytes);
    }

    fn slice_upload_error(&self) {
        self.slices.with_label_values(&["upload", "error"]).inc();
    }

    fn slice_downloaded(&self, bytes: u64) {
        self.slices.with_label_values(&["download", "ok"]).inc();
        self.slice_bytes.with_label_values(&["download"]).inc_by(bytes);
    }

    fn slice_download_error(&self) {
        self.slices.with_label_values(&["download", "error"]).inc();
    }

    fn generation_committed(&self) {
        self.generations.inc();
    }

    fn cache_hit(&self) {
        self.cache_requests.with_label_values(&["hit"]).inc();
    }

    fn cache_miss(&self) {
        self.cache_requests.with_label_values(&["miss"]).inc();
    }

    fn entries_evicted(&self, amount: u64) {
        self.evictions.inc_by(amount);
    }
}

/// Text exposition of everything registered so far.
pub fn render() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() {
        let metrics = PrometheusMetrics::register().unwrap();
        let shared = metrics.shared();
        shared.slice_uploaded(128);
        shared.cache_miss();
        shared.entries_evicted(3);

        let text = render().unwrap();
        assert!(text.contains("seccloud_slice_bytes_total{direction=\"upload\"} 128"));
        assert!(text.contains("seccloud_cache_requests_total{result=\"miss\"} 1"));
        assert!(text.contains("seccloud_cache_evictions_total 3"));

        // a second registration collides
        assert!(PrometheusMetrics::register().is_err());
    }
}
