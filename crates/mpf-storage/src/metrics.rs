//! Storage metrics collection.
//!
//! Provides standardized metrics for monitoring storage operations:
//! - Store counters by backend and outcome
//! - Bytes uploaded by backend
//! - Retry counters
//! - Local fallback counters by output kind

use metrics::{counter, histogram};

// =============================================================================
// Metric Names
// =============================================================================

/// Metric name constants for consistency.
pub mod names {
    /// Total store operations by backend and outcome.
    pub const STORES_TOTAL: &str = "storage_stores_total";

    /// Bytes sent to a remote backend.
    pub const BYTES_UPLOADED_TOTAL: &str = "storage_bytes_uploaded_total";

    /// Total retry attempts by operation.
    pub const RETRIES_TOTAL: &str = "storage_retries_total";

    /// Outputs stored locally because the remote backend failed.
    pub const LOCAL_FALLBACKS_TOTAL: &str = "storage_local_fallbacks_total";

    /// Store latency in seconds by backend.
    pub const STORE_LATENCY_SECONDS: &str = "storage_store_latency_seconds";

    /// Objects skipped because identical content already existed.
    pub const DEDUP_HITS_TOTAL: &str = "storage_dedup_hits_total";
}

// =============================================================================
// Recording Functions
// =============================================================================

/// Record a completed store call.
pub fn record_store(backend: &str, success: bool, latency_ms: f64) {
    let outcome = if success { "success" } else { "failure" };

    counter!(
        names::STORES_TOTAL,
        "backend" => backend.to_string(),
        "outcome" => outcome
    )
    .increment(1);

    histogram!(
        names::STORE_LATENCY_SECONDS,
        "backend" => backend.to_string()
    )
    .record(latency_ms / 1000.0);
}

pub fn record_bytes_uploaded(backend: &str, bytes: u64) {
    counter!(
        names::BYTES_UPLOADED_TOTAL,
        "backend" => backend.to_string()
    )
    .increment(bytes);
}

/// Record a retry attempt.
pub fn record_retry(operation: &str) {
    counter!(
        names::RETRIES_TOTAL,
        "operation" => operation.to_string()
    )
    .increment(1);
}

pub fn record_local_fallback(kind: &str) {
    counter!(
        names::LOCAL_FALLBACKS_TOTAL,
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_dedup_hit() {
    counter!(names::DEDUP_HITS_TOTAL).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
