//! # flowsmith-metrics
//!
//! Observability for the autonomous loop.
//!
//! This crate provides:
//! - Per-loop metrics and termination reasons
//! - A collector aggregating loops in process
//! - An append-only telemetry log
//! - Offline effectiveness reports comparing two telemetry windows

#![allow(dead_code)]

mod collector;
mod loop_metrics;
mod report;
mod storage;

pub use collector::{GlobalMetrics, MetricsCollector};
pub use loop_metrics::{CompletionCheckResult, LoopMetrics, TerminationReason};
pub use report::{
    generate_report, EffectivenessReport, GateResult, MetricSummary, ReasonBreakdown,
    ReleaseDecision, ReleaseGate, ReportInput, SessionTelemetry,
};
pub use storage::TelemetryLog;
