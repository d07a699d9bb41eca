//! In-process aggregation of loop metrics

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::loop_metrics::{LoopMetrics, TerminationReason};

/// Collects the metrics of every loop run in this process
pub struct MetricsCollector {
    /// Latest metrics by loop id
    loops: Arc<RwLock<HashMap<String, LoopMetrics>>>,
    total_loops: AtomicU64,
    total_tool_calls: AtomicU64,
    total_failures: AtomicU64,
    total_time_ms: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            loops: Arc::new(RwLock::new(HashMap::new())),
            total_loops: AtomicU64::new(0),
            total_tool_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_time_ms: AtomicU64::new(0),
        }
    }

    /// Record a finished loop
    pub async fn record(&self, metrics: &LoopMetrics) {
        self.total_loops.fetch_add(1, Ordering::Relaxed);
        self.total_tool_calls
            .fetch_add(metrics.tool_calls as u64, Ordering::Relaxed);
        self.total_failures
            .fetch_add(metrics.tool_failures as u64, Ordering::Relaxed);
        self.total_time_ms
            .fetch_add(metrics.duration_ms, Ordering::Relaxed);

        let mut loops = self.loops.write().await;
        loops.insert(metrics.loop_id.clone(), metrics.clone());
        debug!(
            "Recorded loop {} ({}, {} iterations)",
            metrics.loop_id, metrics.terminal, metrics.iterations
        );
    }

    pub async fn get(&self, loop_id: &str) -> Option<LoopMetrics> {
        self.loops.read().await.get(loop_id).cloned()
    }

    pub async fn all(&self) -> Vec<LoopMetrics> {
        let loops = self.loops.read().await;
        let mut all: Vec<LoopMetrics> = loops.values().cloned().collect();
        all.sort_by(|a, b| a.loop_id.cmp(&b.loop_id));
        all
    }

    /// Loop counts per termination reason
    pub async fn by_termination(&self) -> HashMap<TerminationReason, usize> {
        let loops = self.loops.read().await;
        let mut counts = HashMap::new();
        for metrics in loops.values() {
            *counts.entry(metrics.terminal).or_insert(0) += 1;
        }
        counts
    }

    pub fn global_summary(&self) -> GlobalMetrics {
        GlobalMetrics {
            total_loops: self.total_loops.load(Ordering::Relaxed),
            total_tool_calls: self.total_tool_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_time_ms: self.total_time_ms.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Totals across every recorded loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalMetrics {
    pub total_loops: u64,
    pub total_tool_calls: u64,
    pub total_failures: u64,
    pub total_time_ms: u64,
}

impl GlobalMetrics {
    pub fn success_rate(&self) -> f32 {
        if self.total_tool_calls == 0 {
            return 1.0;
        }
        let successful = self.total_tool_calls.saturating_sub(self.total_failures);
        successful as f32 / self.total_tool_calls as f32
    }
}
