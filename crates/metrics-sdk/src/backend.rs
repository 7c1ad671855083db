use async_trait::async_trait;

use crate::types::{JobId, JobResult, JobStatusReport, JobTicket, Page, PageRequest, QueryParameters};
use crate::MetricsError;

/// Long-running aggregation jobs: submit, poll, fetch the materialized rows.
#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn submit_job(&self, parameters: &QueryParameters) -> Result<JobTicket, MetricsError>;

    async fn job_status(&self, job_id: &JobId) -> Result<JobStatusReport, MetricsError>;

    /// May fail with [`MetricsError::NotReady`] for a while after the status
    /// endpoint already reports completion.
    async fn job_result(&self, job_id: &JobId) -> Result<JobResult, MetricsError>;
}

/// Offset/limit collection endpoint returning at most `limit` rows per call.
#[async_trait]
pub trait PagedBackend: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, MetricsError>;
}

/// Route set for one view's job endpoints, e.g. prefix `/overview` yields
/// `POST /overview/jobs`, `GET /overview/jobs/{id}/status` and
/// `GET /overview/jobs/{id}/result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRoutes {
    prefix: String,
}

impl JobRoutes {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let trimmed = prefix.trim().trim_end_matches('/');
        let prefix = if trimmed.is_empty() || trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };
        Self { prefix }
    }

    pub fn submit(&self) -> String {
        format!("{}/jobs", self.prefix)
    }

    pub fn status(&self, job_id: &JobId) -> String {
        format!("{}/jobs/{}/status", self.prefix, job_id)
    }

    pub fn result(&self, job_id: &JobId) -> String {
        format!("{}/jobs/{}/result", self.prefix, job_id)
    }
}

impl Default for JobRoutes {
    fn default() -> Self {
        Self::new("")
    }
}
