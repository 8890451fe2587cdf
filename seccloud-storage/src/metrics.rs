use std::sync::Arc;

/// Hooks for slice traffic, commits and cache activity.
///
/// The library only calls these; the binary decides where the numbers go.
pub trait MetricsCollector: Send + Sync {
    fn slice_uploaded(&self, bytes: u64);
    fn slice_upload_error(&self);
    fn slice_downloaded(&self, bytes: u64);
    fn slice_download_error(&self);
    fn generation_committed(&self);
    fn cache_hit(&self);
    fn cache_miss(&self);
    fn entries_evicted(&self, amount: u64);
}

/// Discards everything. Used when no collector is configured.
#[derive(Debug, Clone, Default)]
pub struct NoOpMetrics;

impl MetricsCollector for NoOpMetrics {
    fn slice_uploaded(&self, _bytes: u64) {}
    fn slice_upload_error(&self) {}
    fn slice_downloaded(&self, _bytes: u64) {}
    fn slice_download_error(&self) {}
    fn generation_committed(&self) {}
    fn cache_hit(&self) {}
    fn cache_miss(&self) {}
    fn entries_evicted(&self, _amount: u64) {}
}

/// Cloneable handle to the configured collector.
#[derive(Clone)]
pub struct SharedMetrics(Arc<dyn MetricsCollector>);

impl SharedMetrics {
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self(collector)
    }

    pub fn slice_uploaded(&self, bytes: u64) {
        self.0.slice_uploaded(bytes);
    }

    pub fn slice_upload_error(&self) {
        self.0.slice_upload_error();
    }

    pub fn slice_downloaded(&self, bytes: u64) {
        self.0.slice_downloaded(bytes);
    }

    pub fn slice_download_error(&self) {
        self.0.slice_download_error();
    }

    pub fn generation_committed(&self) {
        self.0.generation_committed();
    }

    pub fn cache_hit(&self) {
        self.0.cache_hit();
    }

    pub fn cache_miss(&self) {
        self.0.cache_miss();
    }

    pub fn entries_evicted(&self, amount: u64) {
        self.0.entries_evicted(amount);
    }
}

impl Default for SharedMetrics {
    fn default() -> Self {
        Self(Arc::new(NoOpMetrics))
    }
}

impl std::fmt::Debug for SharedMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedMetrics")
    }
}
