//! Job-attributable warnings.
//!
//! A remote failure that was recovered by storing locally does not fail the
//! job, but it must stay visible on the job. Backends and the router report
//! those through a [`WarningSink`].

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use mpf_models::JobId;
use serde::Serialize;
use tracing::warn;

/// A non-fatal problem recorded against a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobWarning {
    pub job_id: JobId,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl JobWarning {
    pub fn new(job_id: JobId, message: impl Into<String>) -> Self {
        Self {
            job_id,
            message: message.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Destination for job warnings.
pub trait WarningSink: Send + Sync {
    fn add_warning(&self, job_id: &JobId, message: &str);
}

/// Emits warnings as tracing events only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWarningSink;

impl WarningSink for TracingWarningSink {
    fn add_warning(&self, job_id: &JobId, message: &str) {
        warn!(job_id = %job_id, "Job warning: {}", message);
    }
}

/// Keeps warnings in memory so callers can attach them to the job's output.
#[derive(Debug, Default)]
pub struct InMemoryWarningSink {
    warnings: Mutex<Vec<JobWarning>>,
}

impl InMemoryWarningSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All warnings recorded so far, oldest first.
    pub fn warnings(&self) -> Vec<JobWarning> {
        self.warnings
            .lock()
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    pub fn warnings_for(&self, job_id: &JobId) -> Vec<JobWarning> {
        self.warnings()
            .into_iter()
            .filter(|w| &w.job_id == job_id)
            .collect()
    }

    /// Remove and return everything recorded so far.
    pub fn drain(&self) -> Vec<JobWarning> {
        self.warnings
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default()
    }
}

impl WarningSink for InMemoryWarningSink {
    fn add_warning(&self, job_id: &JobId, message: &str) {
        warn!(job_id = %job_id, "Job warning: {}", message);
        if let Ok(mut warnings) = self.warnings.lock() {
            warnings.push(JobWarning::new(job_id.clone(), message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_sink_records_per_job() {
        let sink = InMemoryWarningSink::new();
        let job_a = JobId::from("a");
        let job_b = JobId::from("b");

        sink.add_warning(&job_a, "first");
        sink.add_warning(&job_b, "second");
        sink.add_warning(&job_a, "third");

        let for_a: Vec<String> = sink
            .warnings_for(&job_a)
            .into_iter()
            .map(|w| w.message)
            .collect();
        assert_eq!(for_a, vec!["first", "third"]);
        assert_eq!(sink.drain().len(), 3);
        assert!(sink.warnings().is_empty());
    }

    #[test]
    fn test_warning_serializes_with_timestamp() {
        let warning = JobWarning::new(JobId::from("job-1"), "stored locally");
        let json = serde_json::to_value(&warning).unwrap();
        assert_eq!(json["job_id"], "job-1");
        assert_eq!(json["message"], "stored locally");
        assert!(json["recorded_at"].is_string());
    }
}
