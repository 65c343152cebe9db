// SPDX-License-Identifier: Apache-2.0

//! Lightweight in-memory metrics for append activity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct AppendMetrics {
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    cleanup_failures: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
}

static APPEND_METRICS: OnceLock<AppendMetrics> = OnceLock::new();

fn metrics() -> &'static AppendMetrics {
    APPEND_METRICS.get_or_init(AppendMetrics::default)
}

pub fn record_append(duration_ms: f64, success: bool) {
    let duration_ms = duration_ms.max(0.0) as u64;
    let metrics = metrics();
    if success {
        metrics.succeeded.fetch_add(1, Ordering::Relaxed);
    } else {
        metrics.failed.fetch_add(1, Ordering::Relaxed);
    }
    metrics
        .duration_total_ms
        .fetch_add(duration_ms, Ordering::Relaxed);
    metrics
        .duration_max_ms
        .fetch_max(duration_ms, Ordering::Relaxed);
}

/// A bulk table that never reached the join engine.
pub fn record_skip() {
    metrics().skipped.fetch_add(1, Ordering::Relaxed);
}

/// An ephemeral symbol whose removal failed.
pub fn record_cleanup_failure() {
    metrics().cleanup_failures.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Serialize)]
pub struct AppendMetricsSnapshot {
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cleanup_failures: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
}

pub fn snapshot() -> AppendMetricsSnapshot {
    let metrics = metrics();
    let succeeded = metrics.succeeded.load(Ordering::Relaxed);
    let failed = metrics.failed.load(Ordering::Relaxed);
    let duration_total = metrics.duration_total_ms.load(Ordering::Relaxed);
    let max_ms = metrics.duration_max_ms.load(Ordering::Relaxed);
    let attempts = succeeded + failed;

    AppendMetricsSnapshot {
        succeeded,
        failed,
        skipped: metrics.skipped.load(Ordering::Relaxed),
        cleanup_failures: metrics.cleanup_failures.load(Ordering::Relaxed),
        avg_ms: (attempts > 0).then(|| duration_total as f64 / attempts as f64),
        max_ms: (max_ms > 0).then_some(max_ms),
    }
}
