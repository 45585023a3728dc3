use std::sync::Mutex;

/// Thread-safe counters for one run.
pub struct MetricsRecorder {
    inner: Mutex<Metrics>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub blocks: usize,
    pub samples: usize,
    pub resets: usize,
    pub errors: usize,
}

#[derive(Default)]
struct Metrics {
    blocks: usize,
    samples: usize,
    resets: usize,
    errors: usize,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Metrics::default()),
        }
    }

    pub fn record_block(&self, samples: usize) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.blocks += 1;
            metrics.samples += samples;
        }
    }

    pub fn record_reset(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.resets += 1;
        }
    }

    pub fn record_error(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.errors += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        if let Ok(metrics) = self.inner.lock() {
            MetricsSnapshot {
                blocks: metrics.blocks,
                samples: metrics.samples,
                resets: metrics.resets,
                errors: metrics.errors,
            }
        } else {
            MetricsSnapshot::default()
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_accumulates_counts() {
        let metrics = MetricsRecorder::new();
        metrics.record_block(128);
        metrics.record_block(64);
        metrics.record_reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.blocks, 2);
        assert_eq!(snapshot.samples, 192);
        assert_eq!(snapshot.resets, 1);
        assert_eq!(snapshot.errors, 0);
    }
}
