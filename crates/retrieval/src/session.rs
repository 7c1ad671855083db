use std::fmt;
use std::sync::Arc;

use metrics_sdk::{JobId, RawRow};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Monotonic counter identifying one fetch session of a view binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    pub fn get(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// Coarse state views branch on: spinner, error with retry, or data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Idle,
    Loading,
    Ready,
    Failed,
}

/// Job lifecycle; pager-driven views stay in `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    Submitting,
    Polling,
    Retrieving,
    Completed,
    Failed,
}

/// Everything a view renders, as of one generation.
#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    pub generation: Generation,
    pub status: LoadStatus,
    pub phase: JobPhase,
    pub job_id: Option<JobId>,
    pub progress: String,
    pub elapsed_seconds: Option<f64>,
    pub rows: Arc<Vec<RawRow>>,
    pub total_known: Option<u64>,
    pub initial_load_complete: bool,
    pub retry_count: u32,
    pub error: Option<String>,
}

impl Default for ViewSnapshot {
    fn default() -> Self {
        Self {
            generation: Generation::default(),
            status: LoadStatus::Idle,
            phase: JobPhase::Idle,
            job_id: None,
            progress: String::new(),
            elapsed_seconds: None,
            rows: Arc::new(Vec::new()),
            total_known: None,
            initial_load_complete: false,
            retry_count: 0,
            error: None,
        }
    }
}

impl ViewSnapshot {
    /// Failed with rows from earlier pages still shown.
    pub fn is_partial(&self) -> bool {
        self.status == LoadStatus::Failed && !self.rows.is_empty()
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, LoadStatus::Ready | LoadStatus::Failed)
    }

    pub(crate) fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = LoadStatus::Failed;
        if self.phase != JobPhase::Idle {
            self.phase = JobPhase::Failed;
        }
        self.error = Some(message.into());
    }

    pub(crate) fn append_rows(&mut self, rows: Vec<RawRow>) {
        Arc::make_mut(&mut self.rows).extend(rows);
    }

    pub(crate) fn replace_rows(&mut self, rows: Vec<RawRow>) {
        self.rows = Arc::new(rows);
    }
}

/// One logical attempt at loading a view for a given set of parameters.
#[derive(Debug, Clone)]
pub struct FetchSession<P> {
    pub parameters: P,
    pub generation: Generation,
    pub cancel: CancellationToken,
}

/// Published state of one view binding.
///
/// The current generation lives inside the snapshot, so the staleness check
/// and the write it guards happen under the same lock.
#[derive(Clone)]
pub struct ViewState {
    tx: Arc<watch::Sender<ViewSnapshot>>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ViewSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.tx.borrow().clone()
    }

    pub fn current_generation(&self) -> Generation {
        self.tx.borrow().generation
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.current_generation() == generation
    }

    /// Starts a new session: bumps the generation and resets the snapshot
    /// to an empty loading state. Every earlier generation is stale from
    /// here on.
    pub fn begin<P>(&self, parameters: P, phase: JobPhase) -> FetchSession<P> {
        let mut generation = Generation::default();
        self.tx.send_modify(|snapshot| {
            generation = snapshot.generation.next();
            *snapshot = ViewSnapshot {
                generation,
                status: LoadStatus::Loading,
                phase,
                ..ViewSnapshot::default()
            };
        });
        debug!(generation = %generation, "fetch session started");
        FetchSession {
            parameters,
            generation,
            cancel: CancellationToken::new(),
        }
    }

    /// Applies `update` only if `generation` is still current. Returns
    /// whether the write happened.
    pub fn apply<F>(&self, generation: Generation, update: F) -> bool
    where
        F: FnOnce(&mut ViewSnapshot),
    {
        let applied = self.tx.send_if_modified(|snapshot| {
            if snapshot.generation != generation {
                return false;
            }
            update(snapshot);
            true
        });
        if !applied {
            debug!(generation = %generation, "stale update discarded");
        }
        applied
    }

    /// Waits until the snapshot of `generation` settles (ready or failed),
    /// or a newer generation replaces it.
    pub async fn settled(&self, generation: Generation) -> ViewSnapshot {
        let mut rx = self.subscribe();
        let result = rx
            .wait_for(|snapshot| snapshot.generation != generation || snapshot.is_settled())
            .await
            .map(|snapshot| snapshot.clone());
        match result {
            Ok(snapshot) => snapshot,
            Err(_) => self.snapshot(),
        }
    }
}
