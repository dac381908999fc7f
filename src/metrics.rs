//! Metrics and Observability Module
//!
//! Aggregates per-model stream-health counters (malformed frames, fallback
//! repairs, validation failures) so individual frame problems stay at debug
//! level without losing visibility.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelStreamMetrics {
    pub streams: u64,
    pub malformed_frames: u64,
    pub fence_repairs: u64,
    pub empty_streams: u64,
    pub incomplete_streams: u64,
}

/// Global metrics aggregator, keyed by model id.
pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<String, ModelStreamMetrics>>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record one consumed stream and however many frames it discarded.
    pub async fn record_stream(&self, model: &str, malformed_frames: u64) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(model.to_string()).or_default();
        entry.streams += 1;
        entry.malformed_frames += malformed_frames;
    }

    pub async fn record_fence_repair(&self, model: &str) {
        let mut metrics = self.metrics.write().await;
        metrics.entry(model.to_string()).or_default().fence_repairs += 1;
    }

    pub async fn record_empty_stream(&self, model: &str) {
        let mut metrics = self.metrics.write().await;
        metrics.entry(model.to_string()).or_default().empty_streams += 1;
    }

    pub async fn record_incomplete_stream(&self, model: &str) {
        let mut metrics = self.metrics.write().await;
        metrics
            .entry(model.to_string())
            .or_default()
            .incomplete_streams += 1;
    }

    pub async fn get_metrics(&self, model: &str) -> Option<ModelStreamMetrics> {
        self.metrics.read().await.get(model).cloned()
    }

    pub async fn get_all_metrics(&self) -> HashMap<String, ModelStreamMetrics> {
        self.metrics.read().await.clone()
    }

    /// Log aggregated summary.
    pub async fn log_summary(&self) {
        let metrics = self.metrics.read().await;
        if metrics.is_empty() {
            return;
        }
        tracing::info!("=== STREAM HEALTH SUMMARY ===");
        for (model, m) in metrics.iter() {
            let malformed_rate = if m.streams > 0 {
                m.malformed_frames as f64 / m.streams as f64
            } else {
                0.0
            };
            tracing::info!(
                "Model {}: {} streams | {} malformed frames ({:.2}/stream) | {} repairs | {} empty | {} incomplete",
                model,
                m.streams,
                m.malformed_frames,
                malformed_rate,
                m.fence_repairs,
                m.empty_streams,
                m.incomplete_streams
            );
        }
        tracing::info!("=============================");
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_stream_accumulates() {
        let agg = MetricsAggregator::new();
        agg.record_stream("deepseek-chat", 2).await;
        agg.record_stream("deepseek-chat", 0).await;

        let m = agg.get_metrics("deepseek-chat").await.unwrap();
        assert_eq!(m.streams, 2);
        assert_eq!(m.malformed_frames, 2);
    }

    #[tokio::test]
    async fn test_failure_counters_are_separate() {
        let agg = MetricsAggregator::new();
        agg.record_empty_stream("m1").await;
        agg.record_incomplete_stream("m1").await;
        agg.record_incomplete_stream("m1").await;

        let m = agg.get_metrics("m1").await.unwrap();
        assert_eq!(m.empty_streams, 1);
        assert_eq!(m.incomplete_streams, 2);
    }

    #[tokio::test]
    async fn test_multiple_models_tracked_independently() {
        let agg = MetricsAggregator::new();
        agg.record_fence_repair("m1").await;
        agg.record_fence_repair("m2").await;
        assert_eq!(agg.get_all_metrics().await.len(), 2);
    }
}
