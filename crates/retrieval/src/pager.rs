use std::num::NonZeroU32;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use metrics_sdk::{MetricsError, PageRequest, PagedBackend, QueryParameters, RawRow};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::retry::{self, GateError, RetryPolicy};
use crate::session::{Generation, JobPhase, LoadStatus, ViewSnapshot, ViewState};

/// Position in an offset/limit collection. A page shorter (or longer) than
/// `page_size` is the only end-of-data signal; `total_known` is kept for
/// display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    offset: u64,
    page_size: NonZeroU32,
    total_known: Option<u64>,
    finished: bool,
}

impl PageCursor {
    pub fn new(page_size: NonZeroU32) -> Self {
        Self {
            offset: 0,
            page_size,
            total_known: None,
            finished: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn total_known(&self) -> Option<u64> {
        self.total_known
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_last(&self, received: usize) -> bool {
        received != self.page_size.get() as usize
    }

    pub fn request(&self, parameters: &QueryParameters) -> PageRequest {
        PageRequest {
            parameters: parameters.clone(),
            limit: self.page_size.get(),
            offset: self.offset,
        }
    }

    /// Records a received page of `received` rows and returns whether it
    /// was the last one.
    pub fn advance(&mut self, received: usize, total_rows: Option<u64>) -> bool {
        if total_rows.is_some() {
            self.total_known = total_rows;
        }
        let last = self.is_last(received);
        if last {
            self.finished = true;
        } else {
            self.offset += u64::from(self.page_size.get());
        }
        last
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub offset: u64,
    pub rows: Vec<RawRow>,
    pub total_known: Option<u64>,
    pub is_last: bool,
}

#[derive(Debug, Error)]
pub enum PagerError {
    #[error("paged fetch aborted")]
    Aborted,
    #[error("page at offset {offset} failed after {attempts} attempt(s): {source}")]
    Page {
        offset: u64,
        attempts: u32,
        #[source]
        source: MetricsError,
    },
    #[error("paged fetch superseded by a newer request")]
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSummary {
    pub generation: Generation,
    pub pages: usize,
    pub rows: usize,
    pub total_known: Option<u64>,
}

type RetryHook = Box<dyn FnMut(u32) + Send>;

/// Sequential pages of one collection, each fetched through the retry gate.
/// Ends after the short page or the first error; not restartable.
pub struct PageSequence {
    backend: Arc<dyn PagedBackend>,
    parameters: QueryParameters,
    cursor: PageCursor,
    policy: RetryPolicy,
    cancel: CancellationToken,
    on_retry: Option<RetryHook>,
}

impl PageSequence {
    pub fn new(
        backend: Arc<dyn PagedBackend>,
        parameters: QueryParameters,
        page_size: NonZeroU32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            parameters,
            cursor: PageCursor::new(page_size),
            policy: RetryPolicy::page_fetch(),
            cancel,
            on_retry: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Called with the failed attempt number before each retry delay.
    pub fn on_retry(mut self, hook: impl FnMut(u32) + Send + 'static) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<FetchedPage, PagerError>> + Send {
        stream::unfold(self, |mut pages| async move {
            let item = pages.next_page().await?;
            Some((item, pages))
        })
    }

    async fn next_page(&mut self) -> Option<Result<FetchedPage, PagerError>> {
        if self.cursor.is_finished() {
            return None;
        }
        let request = self.cursor.request(&self.parameters);
        let backend = &self.backend;
        let hook = &mut self.on_retry;
        let outcome = retry::attempt_observed(
            self.policy,
            &self.cancel,
            MetricsError::is_transient,
            || backend.fetch_page(&request),
            |attempt, _| {
                if let Some(hook) = hook.as_mut() {
                    hook(attempt);
                }
            },
        )
        .await;

        match outcome {
            Ok(page) => {
                let is_last = self.cursor.advance(page.data.len(), page.total_rows);
                Some(Ok(FetchedPage {
                    offset: request.offset,
                    rows: page.data,
                    total_known: self.cursor.total_known(),
                    is_last,
                }))
            }
            Err(GateError::Aborted) => {
                self.cursor.finish();
                Some(Err(PagerError::Aborted))
            }
            Err(GateError::Failed { attempts, error }) => {
                self.cursor.finish();
                Some(Err(PagerError::Page {
                    offset: request.offset,
                    attempts,
                    source: error,
                }))
            }
        }
    }
}

struct ActiveFetch {
    generation: Generation,
    cancel: CancellationToken,
}

/// Loads a whole paged collection into one view binding. Starting a new
/// fetch aborts the previous one.
pub struct ExhaustivePager {
    backend: Arc<dyn PagedBackend>,
    state: ViewState,
    policy: RetryPolicy,
    active: Mutex<Option<ActiveFetch>>,
}

impl ExhaustivePager {
    pub fn new(backend: Arc<dyn PagedBackend>) -> Self {
        Self::with_state(backend, RetryPolicy::page_fetch(), ViewState::new())
    }

    pub fn with_state(backend: Arc<dyn PagedBackend>, policy: RetryPolicy, state: ViewState) -> Self {
        Self {
            backend,
            state,
            policy,
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.state.snapshot()
    }

    /// Fetches every page of `parameters`, publishing rows as each page
    /// arrives. Rows from earlier pages stay published when a later page
    /// fails.
    pub async fn fetch_all(
        &self,
        parameters: QueryParameters,
        page_size: NonZeroU32,
    ) -> Result<FetchSummary, PagerError> {
        let session = {
            let mut active = self.active.lock();
            if let Some(previous) = active.take() {
                debug!(generation = %previous.generation, "aborting previous paged fetch");
                previous.cancel.cancel();
            }
            let session = self.state.begin(parameters, JobPhase::Idle);
            *active = Some(ActiveFetch {
                generation: session.generation,
                cancel: session.cancel.clone(),
            });
            session
        };
        let generation = session.generation;
        let table = session.parameters.table_name.clone();
        info!(
            table = %table,
            generation = %generation,
            page_size = page_size.get(),
            "paged fetch started"
        );

        let observer = self.state.clone();
        let mut pages = Box::pin(
            PageSequence::new(
                Arc::clone(&self.backend),
                session.parameters,
                page_size,
                session.cancel,
            )
            .with_policy(self.policy)
            .on_retry(move |attempt| {
                observer.apply(generation, |s| s.retry_count = attempt);
            })
            .into_stream(),
        );

        let mut summary = FetchSummary {
            generation,
            pages: 0,
            rows: 0,
            total_known: None,
        };
        let outcome = loop {
            let Some(item) = pages.next().await else {
                break Ok(());
            };
            match item {
                Ok(page) => {
                    let received = page.rows.len();
                    let total_known = page.total_known;
                    let is_last = page.is_last;
                    let rows = page.rows;
                    let applied = self.state.apply(generation, |s| {
                        s.append_rows(rows);
                        s.total_known = total_known;
                        s.retry_count = 0;
                        s.progress = format!("Loaded {} records", s.rows.len());
                        if is_last {
                            s.status = LoadStatus::Ready;
                            s.initial_load_complete = true;
                        }
                    });
                    if !applied {
                        break Err(PagerError::Superseded);
                    }
                    summary.pages += 1;
                    summary.rows += received;
                    summary.total_known = total_known;
                    debug!(
                        table = %table,
                        offset = page.offset,
                        received,
                        accumulated = summary.rows,
                        "page applied"
                    );
                }
                Err(PagerError::Aborted) => break Err(PagerError::Aborted),
                Err(err) => {
                    error!(
                        table = %table,
                        accumulated = summary.rows,
                        error = %err,
                        "paged fetch failed"
                    );
                    let message = format!("failed to load data: {err}");
                    let applied = self.state.apply(generation, |s| {
                        s.mark_failed(message);
                        s.initial_load_complete = true;
                    });
                    break Err(if applied { err } else { PagerError::Superseded });
                }
            }
        };

        self.release(generation);
        match outcome {
            Ok(()) => {
                info!(
                    table = %table,
                    pages = summary.pages,
                    rows = summary.rows,
                    "paged fetch complete"
                );
                Ok(summary)
            }
            Err(err) => Err(err),
        }
    }

    /// Aborts the in-flight fetch, if any. Published state is left as is.
    pub fn cancel(&self) {
        if let Some(active) = self.active.lock().take() {
            debug!(generation = %active.generation, "paged fetch cancelled");
            active.cancel.cancel();
        }
    }

    fn release(&self, generation: Generation) {
        let mut active = self.active.lock();
        if active.as_ref().map(|a| a.generation) == Some(generation) {
            active.take();
        }
    }
}

impl Drop for ExhaustivePager {
    fn drop(&mut self) {
        self.cancel();
    }
}
