use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Counters for one pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetric {
    pub stage: String,
    pub processed: usize,
    pub errors: usize,
}

/// Per-stage counters shared by the stages of one merge run.
pub struct MetricsRecorder {
    inner: Mutex<BTreeMap<&'static str, Metrics>>,
}

#[derive(Default)]
struct Metrics {
    processed: usize,
    errors: usize,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record_processed(&self, stage: &'static str, count: usize) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.entry(stage).or_default().processed += count;
        }
    }

    pub fn record_error(&self, stage: &'static str) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.entry(stage).or_default().errors += 1;
        }
    }

    pub fn snapshot(&self) -> Vec<StageMetric> {
        if let Ok(metrics) = self.inner.lock() {
            metrics
                .iter()
                .map(|(stage, m)| StageMetric {
                    stage: stage.to_string(),
                    processed: m.processed,
                    errors: m.errors,
                })
                .collect()
        } else {
            Vec::new()
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
    fn snapshot_is_ordered_by_stage_name() {
        let recorder = MetricsRecorder::new();
        recorder.record_processed("projection", 3);
        recorder.record_processed("overlap", 1);
        recorder.record_error("projection");
        let snapshot = recorder.snapshot();
        assert_eq!(snapshot[0].stage, "overlap");
        assert_eq!(snapshot[1].processed, 3);
        assert_eq!(snapshot[1].errors, 1);
    }
}
