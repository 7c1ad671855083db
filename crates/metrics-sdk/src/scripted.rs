use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;

use crate::backend::{JobBackend, PagedBackend};
use crate::row::RawRow;
use crate::types::{JobId, JobResult, JobStatus, JobStatusReport, JobTicket, Page, PageRequest, QueryParameters};
use crate::MetricsError;

/// Failure a scripted call should produce. Converted into a fresh
/// [`MetricsError`] each time since the real error type is not `Clone`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    NotReady,
    Network,
    Unauthorized,
    Status(u16),
}

impl ScriptedFailure {
    fn into_error(self, resource: &str) -> MetricsError {
        match self {
            ScriptedFailure::NotReady => MetricsError::NotReady {
                resource: resource.to_string(),
            },
            ScriptedFailure::Network => {
                MetricsError::Unavailable(format!("connection reset while calling {resource}"))
            }
            ScriptedFailure::Unauthorized => MetricsError::Unauthorized,
            ScriptedFailure::Status(code) => MetricsError::UnexpectedStatus {
                status: StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                body: format!("scripted {code}"),
            },
        }
    }
}

type Scripted<T> = Result<T, ScriptedFailure>;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Submit { table_name: String },
    Status(JobId),
    Result(JobId),
    Page { table_name: String, offset: u64, limit: u32 },
}

#[derive(Default)]
struct Script {
    tickets: VecDeque<Scripted<JobTicket>>,
    submitted: u64,
    statuses: HashMap<JobId, VecDeque<Scripted<JobStatusReport>>>,
    results: HashMap<JobId, VecDeque<Scripted<JobResult>>>,
    pages: HashMap<(String, u64), VecDeque<Scripted<Page>>>,
    submit_latency: Option<Duration>,
    job_latency: HashMap<JobId, Duration>,
    table_latency: HashMap<String, Duration>,
    calls: Vec<RecordedCall>,
}

/// In-memory backend for tests and early wiring.
///
/// Responses are queued per job id (status, result) or per
/// `(table_name, offset)` (pages) and consumed in order. When a queue runs
/// dry the backend answers conservatively: status `processing`, result
/// not-ready, and an empty page. Jobs submitted without a queued ticket get
/// sequential ids `job-1`, `job-2`, ...
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_ticket(&self, ticket: JobTicket) {
        self.script.lock().tickets.push_back(Ok(ticket));
    }

    pub fn push_submit_failure(&self, failure: ScriptedFailure) {
        self.script.lock().tickets.push_back(Err(failure));
    }

    pub fn push_status(&self, job_id: &str, report: JobStatusReport) {
        self.script
            .lock()
            .statuses
            .entry(JobId::new(job_id))
            .or_default()
            .push_back(Ok(report));
    }

    pub fn push_status_failure(&self, job_id: &str, failure: ScriptedFailure) {
        self.script
            .lock()
            .statuses
            .entry(JobId::new(job_id))
            .or_default()
            .push_back(Err(failure));
    }

    pub fn push_result(&self, job_id: &str, result: JobResult) {
        self.script
            .lock()
            .results
            .entry(JobId::new(job_id))
            .or_default()
            .push_back(Ok(result));
    }

    pub fn push_result_failure(&self, job_id: &str, failure: ScriptedFailure) {
        self.script
            .lock()
            .results
            .entry(JobId::new(job_id))
            .or_default()
            .push_back(Err(failure));
    }

    pub fn push_page(&self, table_name: &str, offset: u64, page: Page) {
        self.script
            .lock()
            .pages
            .entry((table_name.to_string(), offset))
            .or_default()
            .push_back(Ok(page));
    }

    pub fn push_page_failure(&self, table_name: &str, offset: u64, failure: ScriptedFailure) {
        self.script
            .lock()
            .pages
            .entry((table_name.to_string(), offset))
            .or_default()
            .push_back(Err(failure));
    }

    /// Queues consecutive pages of the given sizes starting at offset 0.
    /// Rows carry `table_name` and a running `row` index.
    pub fn script_page_sizes(
        &self,
        table_name: &str,
        page_size: u32,
        sizes: &[usize],
        total_rows: Option<u64>,
    ) {
        let mut index = 0u64;
        for (n, size) in sizes.iter().enumerate() {
            let data = (0..*size)
                .map(|_| {
                    let row = RawRow::new()
                        .with("table_name", table_name)
                        .with("row", index);
                    index += 1;
                    row
                })
                .collect();
            let offset = n as u64 * u64::from(page_size);
            self.push_page(table_name, offset, Page { data, total_rows });
        }
    }

    /// Delays every submit response.
    pub fn set_submit_latency(&self, latency: Duration) {
        self.script.lock().submit_latency = Some(latency);
    }

    /// Delays status and result responses for `job_id`.
    pub fn set_job_latency(&self, job_id: &str, latency: Duration) {
        self.script
            .lock()
            .job_latency
            .insert(JobId::new(job_id), latency);
    }

    /// Delays page responses for `table_name`.
    pub fn set_table_latency(&self, table_name: &str, latency: Duration) {
        self.script
            .lock()
            .table_latency
            .insert(table_name.to_string(), latency);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script.lock().calls.clone()
    }

    pub fn status_calls(&self, job_id: &str) -> usize {
        let id = JobId::new(job_id);
        self.count(|call| matches!(call, RecordedCall::Status(j) if *j == id))
    }

    pub fn result_calls(&self, job_id: &str) -> usize {
        let id = JobId::new(job_id);
        self.count(|call| matches!(call, RecordedCall::Result(j) if *j == id))
    }

    pub fn submissions(&self) -> usize {
        self.count(|call| matches!(call, RecordedCall::Submit { .. }))
    }

    /// Offsets requested for `table_name`, in request order.
    pub fn page_offsets(&self, table_name: &str) -> Vec<u64> {
        self.script
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                RecordedCall::Page {
                    table_name: t,
                    offset,
                    ..
                } if t == table_name => Some(*offset),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&RecordedCall) -> bool) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    fn job_delay(&self, job_id: &JobId) -> Option<Duration> {
        self.script.lock().job_latency.get(job_id).copied()
    }

    async fn pause(delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl JobBackend for ScriptedBackend {
    async fn submit_job(&self, parameters: &QueryParameters) -> Result<JobTicket, MetricsError> {
        let (next, delay) = {
            let mut script = self.script.lock();
            script.calls.push(RecordedCall::Submit {
                table_name: parameters.table_name.clone(),
            });
            script.submitted += 1;
            let fallback = JobTicket::for_job(format!("job-{}", script.submitted));
            let next = script.tickets.pop_front().unwrap_or(Ok(fallback));
            (next, script.submit_latency)
        };
        Self::pause(delay).await;
        next.map_err(|failure| failure.into_error("/jobs"))
    }

    async fn job_status(&self, job_id: &JobId) -> Result<JobStatusReport, MetricsError> {
        let next = {
            let mut script = self.script.lock();
            script.calls.push(RecordedCall::Status(job_id.clone()));
            script
                .statuses
                .get_mut(job_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(JobStatusReport::new(JobStatus::Processing)))
        };
        Self::pause(self.job_delay(job_id)).await;
        next.map_err(|failure| failure.into_error(&format!("/jobs/{job_id}/status")))
    }

    async fn job_result(&self, job_id: &JobId) -> Result<JobResult, MetricsError> {
        let next = {
            let mut script = self.script.lock();
            script.calls.push(RecordedCall::Result(job_id.clone()));
            script
                .results
                .get_mut(job_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Err(ScriptedFailure::NotReady))
        };
        Self::pause(self.job_delay(job_id)).await;
        next.map_err(|failure| failure.into_error(&format!("/jobs/{job_id}/result")))
    }
}

#[async_trait]
impl PagedBackend for ScriptedBackend {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, MetricsError> {
        let table_name = request.parameters.table_name.clone();
        let (next, delay) = {
            let mut script = self.script.lock();
            script.calls.push(RecordedCall::Page {
                table_name: table_name.clone(),
                offset: request.offset,
                limit: request.limit,
            });
            let next = script
                .pages
                .get_mut(&(table_name.clone(), request.offset))
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(Page::default()));
            (next, script.table_latency.get(&table_name).copied())
        };
        Self::pause(delay).await;
        next.map_err(|failure| failure.into_error("/paged-collection"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assigns_sequential_job_ids() {
        let backend = ScriptedBackend::new();
        let params = QueryParameters::new("acme").unwrap();
        let first = backend.submit_job(&params).await.unwrap().into_job_id().unwrap();
        let second = backend.submit_job(&params).await.unwrap().into_job_id().unwrap();
        assert_eq!(first.as_str(), "job-1");
        assert_eq!(second.as_str(), "job-2");
        assert_eq!(backend.submissions(), 2);
    }

    #[tokio::test]
    async fn drained_queues_fall_back_conservatively() {
        let backend = ScriptedBackend::new();
        let job = JobId::new("job-1");
        backend.push_status("job-1", JobStatusReport::new(JobStatus::Completed));

        assert_eq!(backend.job_status(&job).await.unwrap().status, JobStatus::Completed);
        assert_eq!(backend.job_status(&job).await.unwrap().status, JobStatus::Processing);
        assert!(backend.job_result(&job).await.unwrap_err().is_not_ready());
        assert_eq!(backend.status_calls("job-1"), 2);
        assert_eq!(backend.result_calls("job-1"), 1);
    }

    #[tokio::test]
    async fn scripted_pages_are_keyed_by_offset() {
        let backend = ScriptedBackend::new();
        backend.script_page_sizes("acme", 2, &[2, 1], Some(3));
        let request = |offset| PageRequest {
            parameters: QueryParameters::new("acme").unwrap(),
            limit: 2,
            offset,
        };
        let second = backend.fetch_page(&request(2)).await.unwrap();
        assert_eq!(second.data.len(), 1);
        assert_eq!(second.data[0].number("row"), 2.0);
        assert_eq!(second.total_rows, Some(3));
        assert_eq!(backend.page_offsets("acme"), vec![2]);
    }

    #[tokio::test]
    async fn failures_map_to_metrics_errors() {
        let backend = ScriptedBackend::new();
        backend.push_page_failure("acme", 0, ScriptedFailure::Status(500));
        backend.push_page_failure("acme", 0, ScriptedFailure::Network);
        let request = PageRequest {
            parameters: QueryParameters::new("acme").unwrap(),
            limit: 10,
            offset: 0,
        };
        let server = backend.fetch_page(&request).await.unwrap_err();
        assert!(!server.is_transient());
        let network = backend.fetch_page(&request).await.unwrap_err();
        assert!(network.is_transient());
    }
}
