//! Asynchronous client for the dashboard metrics API.
//!
//! Consumed by the retrieval layer (job polling, exhaustive pagination) and
//! by the `dashboard-sync` binary. The HTTP specifics live here; everything
//! above talks to the [`JobBackend`] and [`PagedBackend`] traits so tests can
//! swap in the [`ScriptedBackend`].

pub mod backend;
pub mod row;
pub mod scripted;
pub mod types;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

pub use backend::{JobBackend, JobRoutes, PagedBackend};
pub use row::RawRow;
pub use scripted::ScriptedBackend;
pub use types::{
    JobId, JobResult, JobStatus, JobStatusReport, JobTicket, Page, PageRequest, QueryParameters,
};

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{resource} is not ready yet")]
    NotReady { resource: String },
    #[error("credential rejected by metrics api")]
    Unauthorized,
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("submit response carried no job id")]
    MissingJobId,
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
    #[error("metrics api unavailable: {0}")]
    Unavailable(String),
}

impl MetricsError {
    /// The "result not materialized yet" signal (HTTP 404).
    pub fn is_not_ready(&self) -> bool {
        matches!(self, MetricsError::NotReady { .. })
    }

    /// Not-ready plus transport-level failures that say nothing about the
    /// request itself. Bad requests, auth and server errors are excluded.
    pub fn is_transient(&self) -> bool {
        match self {
            MetricsError::NotReady { .. } | MetricsError::Unavailable(_) => true,
            MetricsError::Http(err) => err.is_connect() || err.is_timeout(),
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct MetricsClient {
    http: Client,
    base_url: String,
    token: String,
}

impl MetricsClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_http(Client::new(), base_url, token)
    }

    pub fn with_http(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Job endpoints of one view.
    pub fn jobs(&self, routes: JobRoutes) -> JobEndpoint {
        JobEndpoint {
            client: self.clone(),
            routes,
        }
    }

    /// Paged collection endpoint at `path`.
    pub fn paged(&self, path: impl Into<String>) -> PagedEndpoint {
        let path: String = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        PagedEndpoint {
            client: self.clone(),
            path,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute<T>(&self, path: &str, request: RequestBuilder) -> Result<T, MetricsError>
    where
        T: DeserializeOwned,
    {
        let res = request.bearer_auth(&self.token).send().await?;
        let status = res.status();
        debug!(target = "metrics.http", path, status = %status, "metrics api response");

        if status.is_success() {
            return Ok(res.json::<T>().await?);
        }
        match status {
            StatusCode::NOT_FOUND => Err(MetricsError::NotReady {
                resource: path.to_string(),
            }),
            StatusCode::UNAUTHORIZED => Err(MetricsError::Unauthorized),
            _ => {
                let body = res.text().await.unwrap_or_default();
                Err(MetricsError::UnexpectedStatus { status, body })
            }
        }
    }

    async fn get<T>(&self, path: &str) -> Result<T, MetricsError>
    where
        T: DeserializeOwned,
    {
        debug!(target = "metrics.http", method = "GET", path, "metrics api request");
        self.execute(path, self.http.get(self.url(path))).await
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, MetricsError>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(target = "metrics.http", method = "POST", path, "metrics api request");
        self.execute(path, self.http.post(self.url(path)).json(body))
            .await
    }
}

#[derive(Clone)]
pub struct JobEndpoint {
    client: MetricsClient,
    routes: JobRoutes,
}

#[async_trait]
impl JobBackend for JobEndpoint {
    async fn submit_job(&self, parameters: &QueryParameters) -> Result<JobTicket, MetricsError> {
        self.client.post(&self.routes.submit(), parameters).await
    }

    async fn job_status(&self, job_id: &JobId) -> Result<JobStatusReport, MetricsError> {
        self.client.get(&self.routes.status(job_id)).await
    }

    async fn job_result(&self, job_id: &JobId) -> Result<JobResult, MetricsError> {
        self.client.get(&self.routes.result(job_id)).await
    }
}

#[derive(Clone)]
pub struct PagedEndpoint {
    client: MetricsClient,
    path: String,
}

#[async_trait]
impl PagedBackend for PagedEndpoint {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, MetricsError> {
        self.client.post(&self.path, request).await
    }
}
