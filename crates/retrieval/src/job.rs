use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics_sdk::{JobBackend, JobId, JobStatus, JobStatusReport, MetricsError, QueryParameters};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::retry::{self, GateError, RetryPolicy};
use crate::session::{Generation, JobPhase, LoadStatus, ViewSnapshot, ViewState};

const DEFAULT_PROGRESS: &str = "Processing...";
const STARTING: &str = "Starting processing...";
const DOWNLOADING: &str = "Processing complete, downloading data...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub poll_interval: Duration,
    pub result_retry: RetryPolicy,
    /// Give up polling after this long. `None` polls until the backend
    /// reports a terminal status.
    pub max_poll_duration: Option<Duration>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(3_000),
            result_retry: RetryPolicy::job_result(),
            max_poll_duration: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("a submission is already in flight for this view")]
    InFlight,
    #[error("submission superseded before the job was recorded")]
    Superseded,
    #[error("submission cancelled before the job was recorded")]
    Cancelled,
    #[error(transparent)]
    Backend(#[from] MetricsError),
}

#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: JobId,
    pub generation: Generation,
    cancel: CancellationToken,
}

impl JobHandle {
    /// True once the job was cancelled or superseded.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the job is cancelled or superseded.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Session slot of the current submission. `job_id` stays empty until the
/// backend has answered the submit call.
struct ActivePoll {
    job_id: Option<JobId>,
    cancel: CancellationToken,
}

/// Clears the in-flight flag however `submit` exits.
struct SubmitGuard<'a>(&'a AtomicBool);

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives one backend aggregation job per view binding:
/// submit → poll → fetch result, superseding older jobs on resubmission.
pub struct JobController {
    backend: Arc<dyn JobBackend>,
    state: ViewState,
    config: JobConfig,
    submitting: AtomicBool,
    active: Mutex<Option<ActivePoll>>,
}

impl JobController {
    pub fn new(backend: Arc<dyn JobBackend>, config: JobConfig) -> Self {
        Self::with_state(backend, config, ViewState::new())
    }

    pub fn with_state(backend: Arc<dyn JobBackend>, config: JobConfig, state: ViewState) -> Self {
        Self {
            backend,
            state,
            config,
            submitting: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.state.snapshot()
    }

    /// Job id of the poll loop currently running, if any.
    pub fn active_job(&self) -> Option<JobId> {
        self.active
            .lock()
            .as_ref()
            .filter(|active| !active.cancel.is_cancelled())
            .and_then(|active| active.job_id.clone())
    }

    /// Submits a new job for `parameters`. Any previous poll loop is stopped
    /// first and its job becomes stale. Only one submission may be awaiting
    /// the backend at a time.
    pub async fn submit(&self, parameters: QueryParameters) -> Result<JobHandle, SubmitError> {
        if self.submitting.swap(true, Ordering::AcqRel) {
            warn!(table = %parameters.table_name, "submission already in flight; ignoring");
            return Err(SubmitError::InFlight);
        }
        let _guard = SubmitGuard(&self.submitting);

        self.stop_polling();
        let session = self.state.begin(parameters, JobPhase::Submitting);
        let generation = session.generation;
        self.state.apply(generation, |s| s.progress = STARTING.to_string());
        *self.active.lock() = Some(ActivePoll {
            job_id: None,
            cancel: session.cancel.clone(),
        });

        let submitted = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => {
                debug!(generation = %generation, "submission cancelled while awaiting the backend");
                return Err(SubmitError::Cancelled);
            }
            submitted = self.backend.submit_job(&session.parameters) => submitted,
        };
        let job_id = match submitted.and_then(|ticket| ticket.into_job_id()) {
            Ok(job_id) => job_id,
            Err(err) => {
                error!(
                    table = %session.parameters.table_name,
                    error = %err,
                    "job submission failed"
                );
                let message = format!("failed to start processing: {err}");
                self.state.apply(generation, |s| s.mark_failed(message));
                return Err(err.into());
            }
        };

        let recorded = self.state.apply(generation, |s| {
            s.job_id = Some(job_id.clone());
            s.phase = JobPhase::Polling;
            s.progress = DEFAULT_PROGRESS.to_string();
        });
        if !recorded {
            return Err(SubmitError::Superseded);
        }

        let poll = PollLoop {
            backend: Arc::clone(&self.backend),
            state: self.state.clone(),
            config: self.config.clone(),
            job_id: job_id.clone(),
            generation,
            cancel: session.cancel.clone(),
        };
        {
            // `cancel` takes the slot under this lock, so a cancellation
            // either shows up here or reaches the spawned loop.
            let mut active = self.active.lock();
            if session.cancel.is_cancelled() {
                debug!(job_id = %job_id, "submission cancelled before polling started");
                return Err(SubmitError::Cancelled);
            }
            if let Some(active) = active.as_mut() {
                active.job_id = Some(job_id.clone());
            }
            tokio::spawn(poll.run());
        }
        info!(
            job_id = %job_id,
            generation = %generation,
            table = %session.parameters.table_name,
            "job submitted; polling"
        );

        Ok(JobHandle {
            job_id,
            generation,
            cancel: session.cancel,
        })
    }

    /// Stops the poll loop and any pending result fetch (the view went
    /// away). Published state is left as is.
    pub fn cancel(&self) {
        self.stop_polling();
    }

    fn stop_polling(&self) {
        if let Some(previous) = self.active.lock().take() {
            debug!(job_id = ?previous.job_id, "stopping previous poll loop");
            previous.cancel.cancel();
        }
    }
}

impl Drop for JobController {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

struct PollLoop {
    backend: Arc<dyn JobBackend>,
    state: ViewState,
    config: JobConfig,
    job_id: JobId,
    generation: Generation,
    cancel: CancellationToken,
}

impl PollLoop {
    async fn run(self) {
        if self.poll_until_complete().await {
            self.retrieve().await;
        }
    }

    /// Returns true once the backend reports completion; false when the loop
    /// ended for any other reason.
    async fn poll_until_complete(&self) -> bool {
        let Some(limit) = self.config.max_poll_duration else {
            return self.poll_statuses().await;
        };
        let deadline = Instant::now() + limit;
        tokio::select! {
            completed = self.poll_statuses() => completed,
            _ = tokio::time::sleep_until(deadline) => {
                if self.cancel.is_cancelled() || !self.state.is_current(self.generation) {
                    return false;
                }
                warn!(
                    job_id = %self.job_id,
                    limit_secs = limit.as_secs(),
                    "job did not finish in time; giving up"
                );
                let message = format!("job did not finish within {}s", limit.as_secs());
                self.state
                    .apply(self.generation, |s| s.mark_failed(message));
                false
            }
        }
    }

    async fn poll_statuses(&self) -> bool {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(job_id = %self.job_id, "poll loop cancelled");
                    return false;
                }
                _ = ticker.tick() => {}
            }

            if !self.state.is_current(self.generation) {
                debug!(job_id = %self.job_id, "job superseded; poll loop exiting");
                return false;
            }

            // A status call never outlives one poll interval.
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                polled = tokio::time::timeout(
                    self.config.poll_interval,
                    self.backend.job_status(&self.job_id),
                ) => polled,
            };
            let report = match polled {
                Ok(Ok(report)) => report,
                Ok(Err(err)) => {
                    warn!(job_id = %self.job_id, error = %err, "status poll failed; retrying next tick");
                    continue;
                }
                Err(_) => {
                    warn!(
                        job_id = %self.job_id,
                        timeout_ms = self.config.poll_interval.as_millis() as u64,
                        "status poll timed out; retrying next tick"
                    );
                    continue;
                }
            };
            debug!(
                job_id = %self.job_id,
                status = report.status.as_wire(),
                progress = report.progress.as_deref().unwrap_or_default(),
                elapsed = report.elapsed_seconds.unwrap_or_default(),
                "job status"
            );

            let progress = progress_text(&report);
            let applied = self.state.apply(self.generation, |s| {
                if let Some(elapsed) = report.elapsed_seconds {
                    s.elapsed_seconds = Some(elapsed);
                }
                s.progress = progress;
            });
            if !applied {
                return false;
            }

            match report.status {
                JobStatus::Completed => return true,
                JobStatus::Failed => {
                    let message = match &report.progress {
                        Some(detail) => format!("job failed: {detail}"),
                        None => "job failed".to_string(),
                    };
                    error!(job_id = %self.job_id, "backend reported job failure");
                    self.state.apply(self.generation, |s| s.mark_failed(message));
                    return false;
                }
                JobStatus::Pending | JobStatus::Processing => {}
            }
        }
    }

    async fn retrieve(&self) {
        let started = self.state.apply(self.generation, |s| {
            s.phase = JobPhase::Retrieving;
            s.progress = DOWNLOADING.to_string();
        });
        if !started {
            return;
        }
        info!(job_id = %self.job_id, "job completed; fetching result");

        let backend = &self.backend;
        let job_id = &self.job_id;
        let outcome = retry::attempt_observed(
            self.config.result_retry,
            &self.cancel,
            MetricsError::is_not_ready,
            || backend.job_result(job_id),
            |attempt, _| {
                self.state.apply(self.generation, |s| s.retry_count = attempt);
            },
        )
        .await;

        match outcome {
            Ok(result) => {
                let count = result.count.unwrap_or(result.data.len() as u64);
                let rows = result.data.len();
                let applied = self.state.apply(self.generation, |s| {
                    s.replace_rows(result.data);
                    s.total_known = Some(count);
                    s.phase = JobPhase::Completed;
                    s.status = LoadStatus::Ready;
                    s.initial_load_complete = true;
                    s.retry_count = 0;
                    s.progress = format!("Loaded {count} records");
                });
                if applied {
                    info!(job_id = %self.job_id, rows, "job result loaded");
                }
            }
            Err(GateError::Aborted) => {
                debug!(job_id = %self.job_id, "result fetch aborted");
            }
            Err(GateError::Failed { attempts, error }) => {
                error!(
                    job_id = %self.job_id,
                    attempts,
                    error = %error,
                    "failed to fetch job result"
                );
                let message = format!("failed to load results: {error}");
                self.state.apply(self.generation, |s| {
                    s.mark_failed(message);
                    s.initial_load_complete = true;
                });
            }
        }
    }
}

fn progress_text(report: &JobStatusReport) -> String {
    let base = report
        .progress
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or(DEFAULT_PROGRESS);
    match report.elapsed_seconds {
        Some(elapsed) => format!("{base} ({}s)", elapsed.round()),
        None => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_sdk::scripted::ScriptedFailure;
    use metrics_sdk::{JobResult, JobTicket, RawRow, ScriptedBackend};

    fn params(table: &str) -> QueryParameters {
        QueryParameters::new(table).unwrap()
    }

    fn city(name: &str) -> RawRow {
        RawRow::new().with("city", name).with("orders", 1)
    }

    fn completes_with(backend: &ScriptedBackend, job_id: &str, cities: &[&str]) {
        backend.push_status(job_id, JobStatusReport::new(JobStatus::Completed));
        backend.push_result(
            job_id,
            JobResult {
                data: cities.iter().map(|c| city(c)).collect(),
                count: Some(cities.len() as u64),
            },
        );
    }

    #[test]
    fn progress_includes_rounded_elapsed() {
        let report = JobStatusReport::new(JobStatus::Processing)
            .with_progress("Aggregating sessions")
            .with_elapsed(12.6);
        assert_eq!(progress_text(&report), "Aggregating sessions (13s)");

        let bare = JobStatusReport::new(JobStatus::Processing);
        assert_eq!(progress_text(&bare), DEFAULT_PROGRESS);
    }

    #[test]
    fn default_config_matches_dashboard_cadence() {
        let config = JobConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.result_retry.max_attempts, 10);
        assert_eq!(config.result_retry.delay, Duration::from_secs(3));
        assert!(config.max_poll_duration.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn completed_job_publishes_rows_after_result_retries() {
        let backend = ScriptedBackend::new();
        backend.push_status(
            "job-1",
            JobStatusReport::new(JobStatus::Processing).with_elapsed(2.4),
        );
        backend.push_status(
            "job-1",
            JobStatusReport::new(JobStatus::Processing)
                .with_progress("Aggregating")
                .with_elapsed(5.0),
        );
        backend.push_result_failure("job-1", ScriptedFailure::NotReady);
        backend.push_result_failure("job-1", ScriptedFailure::NotReady);
        completes_with(&backend, "job-1", &["Recife", "Olinda"]);

        let controller = JobController::new(backend.clone(), JobConfig::default());
        let started = Instant::now();
        let handle = controller.submit(params("acme")).await.unwrap();
        assert_eq!(handle.job_id.as_str(), "job-1");
        assert_eq!(controller.snapshot().phase, JobPhase::Polling);

        let snapshot = controller.state().settled(handle.generation).await;
        assert_eq!(snapshot.status, LoadStatus::Ready);
        assert_eq!(snapshot.phase, JobPhase::Completed);
        assert_eq!(snapshot.job_id, Some(JobId::new("job-1")));
        assert_eq!(snapshot.rows.len(), 2);
        assert_eq!(snapshot.total_known, Some(2));
        assert_eq!(snapshot.progress, "Loaded 2 records");
        assert_eq!(snapshot.elapsed_seconds, Some(5.0));
        assert!(snapshot.initial_load_complete);
        assert!(snapshot.error.is_none());

        assert_eq!(backend.status_calls("job-1"), 3);
        assert_eq!(backend.result_calls("job-1"), 3);
        // Polls at 0s, 3s, 6s; result attempts at 6s, 9s, 12s.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(12));
        assert!(waited < Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_result_retries_fail_the_view() {
        let backend = ScriptedBackend::new();
        backend.push_status("job-1", JobStatusReport::new(JobStatus::Completed));
        let config = JobConfig {
            result_retry: RetryPolicy::new(3, Duration::from_secs(1)),
            ..JobConfig::default()
        };
        let controller = JobController::new(backend.clone(), config);

        let handle = controller.submit(params("acme")).await.unwrap();
        let snapshot = controller.state().settled(handle.generation).await;
        assert_eq!(snapshot.status, LoadStatus::Failed);
        assert_eq!(snapshot.phase, JobPhase::Failed);
        assert_eq!(snapshot.retry_count, 2);
        assert!(snapshot.initial_load_complete);
        assert!(snapshot
            .error
            .as_deref()
            .unwrap()
            .starts_with("failed to load results"));
        assert_eq!(backend.result_calls("job-1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backend_reported_failure_skips_result_fetch() {
        let backend = ScriptedBackend::new();
        backend.push_status(
            "job-1",
            JobStatusReport::new(JobStatus::Failed).with_progress("query timeout"),
        );
        let controller = JobController::new(backend.clone(), JobConfig::default());

        let handle = controller.submit(params("acme")).await.unwrap();
        let snapshot = controller.state().settled(handle.generation).await;
        assert_eq!(snapshot.status, LoadStatus::Failed);
        assert_eq!(snapshot.phase, JobPhase::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("job failed: query timeout"));
        assert_eq!(backend.result_calls("job-1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resubmission_supersedes_running_job() {
        let backend = ScriptedBackend::new();
        completes_with(&backend, "job-2", &["Olinda"]);
        let controller = JobController::new(backend.clone(), JobConfig::default());

        let first = controller.submit(params("acme")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(7)).await;
        let second = controller.submit(params("globex")).await.unwrap();
        assert_eq!(second.job_id.as_str(), "job-2");
        assert!(!controller.state().is_current(first.generation));

        let snapshot = controller.state().settled(second.generation).await;
        assert_eq!(snapshot.status, LoadStatus::Ready);
        assert_eq!(snapshot.job_id, Some(JobId::new("job-2")));
        assert_eq!(snapshot.rows[0].dimension_value("city"), "Olinda");

        let polls = backend.status_calls("job-1");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.status_calls("job-1"), polls);
        assert_eq!(controller.snapshot().generation, second.generation);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_submission_is_rejected() {
        let backend = ScriptedBackend::new();
        backend.set_submit_latency(Duration::from_secs(1));
        let controller = JobController::new(backend.clone(), JobConfig::default());

        let (first, second) = tokio::join!(
            controller.submit(params("acme")),
            controller.submit(params("globex"))
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(SubmitError::InFlight)));
        assert_eq!(backend.submissions(), 1);

        assert!(controller.submit(params("globex")).await.is_ok());
        assert_eq!(backend.submissions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn status_errors_keep_polling() {
        let backend = ScriptedBackend::new();
        backend.push_status_failure("job-1", ScriptedFailure::Network);
        completes_with(&backend, "job-1", &["Recife"]);
        let controller = JobController::new(backend.clone(), JobConfig::default());

        let handle = controller.submit(params("acme")).await.unwrap();
        let snapshot = controller.state().settled(handle.generation).await;
        assert_eq!(snapshot.status, LoadStatus::Ready);
        assert_eq!(backend.status_calls("job-1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_gives_up_after_max_duration() {
        let backend = ScriptedBackend::new();
        let config = JobConfig {
            max_poll_duration: Some(Duration::from_secs(10)),
            ..JobConfig::default()
        };
        let controller = JobController::new(backend.clone(), config);

        let handle = controller.submit(params("acme")).await.unwrap();
        let snapshot = controller.state().settled(handle.generation).await;
        assert_eq!(snapshot.status, LoadStatus::Failed);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("job did not finish within 10s")
        );
        // Ticks at 0s, 3s, 6s, 9s poll; the deadline at 10s gives up.
        assert_eq!(backend.status_calls("job-1"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_status_call_still_hits_max_poll_duration() {
        let backend = ScriptedBackend::new();
        backend.set_job_latency("job-1", Duration::from_secs(3_600));
        let config = JobConfig {
            max_poll_duration: Some(Duration::from_secs(10)),
            ..JobConfig::default()
        };
        let controller = JobController::new(backend.clone(), config);

        let started = Instant::now();
        let handle = controller.submit(params("acme")).await.unwrap();
        let snapshot = controller.state().settled(handle.generation).await;
        assert!(started.elapsed() < Duration::from_secs(11));
        assert_eq!(snapshot.status, LoadStatus::Failed);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("job did not finish within 10s")
        );
        // Each call is abandoned after one interval and the next tick asks again.
        assert!(backend.status_calls("job-1") >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_submit_never_starts_polling() {
        let backend = ScriptedBackend::new();
        backend.set_submit_latency(Duration::from_secs(2));
        let controller = JobController::new(backend.clone(), JobConfig::default());

        let (submitted, ()) = tokio::join!(controller.submit(params("acme")), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            controller.cancel();
        });
        assert!(matches!(submitted, Err(SubmitError::Cancelled)));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.status_calls("job-1"), 0);
        assert!(controller.active_job().is_none());

        // The controller accepts a fresh submission afterwards.
        let handle = controller.submit(params("acme")).await.unwrap();
        assert!(!handle.is_cancelled());
        assert!(controller.active_job().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn job_handle_observes_cancellation() {
        let backend = ScriptedBackend::new();
        let controller = JobController::new(backend.clone(), JobConfig::default());
        let handle = controller.submit(params("acme")).await.unwrap();
        assert!(!handle.is_cancelled());

        let (_, ()) = tokio::join!(handle.cancelled(), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            controller.cancel();
        });
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_polling_and_keeps_state() {
        let backend = ScriptedBackend::new();
        let controller = JobController::new(backend.clone(), JobConfig::default());
        controller.submit(params("acme")).await.unwrap();
        assert_eq!(controller.active_job(), Some(JobId::new("job-1")));

        tokio::time::sleep(Duration::from_secs(4)).await;
        controller.cancel();
        assert!(controller.active_job().is_none());
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(backend.status_calls("job-1"), 2);
        assert_eq!(controller.snapshot().status, LoadStatus::Loading);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_controller_stops_polling() {
        let backend = ScriptedBackend::new();
        let controller = JobController::new(backend.clone(), JobConfig::default());
        controller.submit(params("acme")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(controller);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.status_calls("job-1"), 1);
    }

    #[tokio::test]
    async fn submit_failures_are_published() {
        let backend = ScriptedBackend::new();
        backend.push_submit_failure(ScriptedFailure::Unauthorized);
        backend.push_ticket(JobTicket::default());
        let controller = JobController::new(backend.clone(), JobConfig::default());

        let rejected = controller.submit(params("acme")).await.unwrap_err();
        assert!(matches!(
            rejected,
            SubmitError::Backend(MetricsError::Unauthorized)
        ));
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, LoadStatus::Failed);
        assert_eq!(snapshot.phase, JobPhase::Failed);

        let missing = controller.submit(params("acme")).await.unwrap_err();
        assert!(matches!(
            missing,
            SubmitError::Backend(MetricsError::MissingJobId)
        ));
        assert!(controller.active_job().is_none());
    }
}
