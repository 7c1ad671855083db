use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use aggregation::{
    aggregate, apply_calculated_metrics, totals, CalculatedMetric, Catalog, CatalogError,
    FieldSpec, FilterError, Formula, FormulaError, Group, GroupQuery, ValueKind,
};
use clap::ValueEnum;
use metrics_sdk::{
    JobBackend, JobRoutes, MetricsClient, MetricsError, PagedBackend, QueryParameters,
};
use retrieval::{
    ExhaustivePager, JobConfig, JobController, JobHandle, LoadStatus, PagerError, RetryPolicy,
    SubmitError, ViewSnapshot, ViewState,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum ViewError {
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("a load is already in flight for this view")]
    InFlight,
    #[error("load superseded by a newer request")]
    Superseded,
    #[error("load cancelled")]
    Cancelled,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Formula(#[from] FormulaError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<SubmitError> for ViewError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::InFlight => ViewError::InFlight,
            SubmitError::Superseded => ViewError::Superseded,
            SubmitError::Cancelled => ViewError::Cancelled,
            SubmitError::Backend(err) => ViewError::Metrics(err),
        }
    }
}

/// The dashboard views this binary knows how to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Overview,
    Influencers,
    Products,
    Orders,
}

/// How a view's rows reach the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Job(JobRoutes),
    Paged(&'static str),
}

impl ViewKind {
    pub fn key(self) -> &'static str {
        match self {
            ViewKind::Overview => "overview",
            ViewKind::Influencers => "influencers",
            ViewKind::Products => "products",
            ViewKind::Orders => "orders",
        }
    }

    pub fn source(self) -> Source {
        match self {
            ViewKind::Overview => Source::Job(JobRoutes::new("/overview")),
            ViewKind::Influencers => Source::Job(JobRoutes::new("/influencers")),
            ViewKind::Products => Source::Job(JobRoutes::new("/products")),
            ViewKind::Orders => Source::Paged("/metrics/orders"),
        }
    }

    /// Field holding the row's date, for client-side date windows.
    pub fn date_field(self) -> Option<&'static str> {
        match self {
            ViewKind::Overview => Some("event_date"),
            ViewKind::Orders => Some("Horario"),
            ViewKind::Influencers | ViewKind::Products => None,
        }
    }

    pub fn default_group_by(self) -> &'static [&'static str] {
        match self {
            ViewKind::Overview => &["platform"],
            ViewKind::Influencers => &["influencer_name"],
            ViewKind::Products => &["item_name"],
            ViewKind::Orders => &["Canal"],
        }
    }

    /// Standard vocabulary plus the columns specific to this view's table.
    pub fn catalog(self) -> Result<Catalog, CatalogError> {
        let mut catalog = Catalog::standard();
        match self {
            ViewKind::Overview => {}
            ViewKind::Influencers => {
                catalog.register_dimension("influencer_name", "Influencer")?;
                catalog.register_dimension("source", "Source")?;
                catalog.register_dimension("medium", "Medium")?;
                catalog.register_metric("gross_value", "Gross value", ValueKind::Currency)?;
                catalog.register_metric("net_value", "Net value", ValueKind::Currency)?;
                catalog.register_metric("transactions", "Transactions", ValueKind::Number)?;
            }
            ViewKind::Products => {
                catalog.register_dimension("item_id", "Item ID")?;
                catalog.register_dimension("item_name", "Item")?;
                catalog.register_dimension("trend_status", "Trend")?;
                catalog.register_dimension("trend_consistency", "Trend consistency")?;
                for week in 1..=4 {
                    catalog.register_metric(
                        format!("purchases_week_{week}"),
                        format!("Purchases week {week}"),
                        ValueKind::Number,
                    )?;
                }
            }
            ViewKind::Orders => {
                for (key, label) in [
                    ("Status", "Status"),
                    ("Canal", "Channel"),
                    ("Categoria_de_Trafico", "Traffic category"),
                    ("Origem", "Source"),
                    ("Midia", "Medium"),
                    ("Campanha", "Campaign"),
                ] {
                    catalog.register_dimension(key, label)?;
                }
                catalog.register_metric("Receita", "Revenue", ValueKind::Currency)?;
            }
        }
        Ok(catalog)
    }
}

enum Retrieval {
    Job(JobController),
    Paged {
        pager: ExhaustivePager,
        page_size: NonZeroU32,
    },
}

/// One dashboard view wired to its retrieval component.
pub struct ViewBinding {
    kind: ViewKind,
    catalog: Catalog,
    retrieval: Retrieval,
}

impl ViewBinding {
    pub fn for_client(
        kind: ViewKind,
        client: &MetricsClient,
        config: &AppConfig,
    ) -> Result<Self, ViewError> {
        match kind.source() {
            Source::Job(routes) => {
                Self::with_jobs(kind, Arc::new(client.jobs(routes)), config.job_config())
            }
            Source::Paged(path) => Self::with_pages(
                kind,
                Arc::new(client.paged(path)),
                config.page_policy(),
                config.page_size,
            ),
        }
    }

    pub fn with_jobs(
        kind: ViewKind,
        backend: Arc<dyn JobBackend>,
        config: JobConfig,
    ) -> Result<Self, ViewError> {
        Ok(Self {
            kind,
            catalog: kind.catalog()?,
            retrieval: Retrieval::Job(JobController::new(backend, config)),
        })
    }

    pub fn with_pages(
        kind: ViewKind,
        backend: Arc<dyn PagedBackend>,
        policy: RetryPolicy,
        page_size: NonZeroU32,
    ) -> Result<Self, ViewError> {
        Ok(Self {
            kind,
            catalog: kind.catalog()?,
            retrieval: Retrieval::Paged {
                pager: ExhaustivePager::with_state(backend, policy, ViewState::new()),
                page_size,
            },
        })
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn state(&self) -> &ViewState {
        match &self.retrieval {
            Retrieval::Job(controller) => controller.state(),
            Retrieval::Paged { pager, .. } => pager.state(),
        }
    }

    /// Loads `parameters` and waits for the view to settle. Backend failures
    /// come back as a failed snapshot; only a superseded, cancelled or
    /// rejected load is an error.
    ///
    /// `cancel` ends a pending load with [`ViewError::Cancelled`]; the state
    /// keeps whatever the view showed when it was cancelled.
    pub async fn load(&self, parameters: QueryParameters) -> Result<ViewSnapshot, ViewError> {
        info!(
            view = self.kind.key(),
            table = %parameters.table_name,
            start = parameters.start_date.as_deref().unwrap_or("unset"),
            end = parameters.end_date.as_deref().unwrap_or("unset"),
            "loading view"
        );
        match &self.retrieval {
            Retrieval::Job(controller) => {
                let handle = match controller.submit(parameters).await {
                    Ok(handle) => handle,
                    Err(SubmitError::Backend(err)) => {
                        debug!(view = self.kind.key(), error = %err, "submit failed");
                        return Ok(controller.snapshot());
                    }
                    Err(err) => return Err(err.into()),
                };
                follow(self.kind, controller.state(), &handle).await
            }
            Retrieval::Paged { pager, page_size } => {
                match pager.fetch_all(parameters, *page_size).await {
                    Ok(summary) => {
                        debug!(
                            view = self.kind.key(),
                            pages = summary.pages,
                            rows = summary.rows,
                            "paged load finished"
                        );
                        Ok(pager.snapshot())
                    }
                    Err(PagerError::Page { .. }) => Ok(pager.snapshot()),
                    Err(PagerError::Aborted) => Err(ViewError::Cancelled),
                    Err(PagerError::Superseded) => Err(ViewError::Superseded),
                }
            }
        }
    }

    pub fn cancel(&self) {
        match &self.retrieval {
            Retrieval::Job(controller) => controller.cancel(),
            Retrieval::Paged { pager, .. } => pager.cancel(),
        }
    }

    /// Shapes a snapshot's rows into the grouped table. Calculated metrics
    /// are applied to a copy of the rows; per-row ones become groupable
    /// metrics, aggregate ones are reported once in `summary`.
    pub fn render(
        &self,
        snapshot: &ViewSnapshot,
        query: &GroupQuery,
        calculated: &[CalculatedMetric],
    ) -> Result<ViewReport, ViewError> {
        let mut catalog = self.catalog.clone();
        let mut rows = snapshot.rows.as_ref().clone();
        let mut summary = BTreeMap::new();

        if !calculated.is_empty() {
            apply_calculated_metrics(&mut rows, calculated)?;
            for metric in calculated {
                let aggregated = Formula::parse(&metric.formula)
                    .map(|formula| formula.has_aggregates())
                    .unwrap_or(false);
                if aggregated {
                    let value = rows.first().map_or(0.0, |row| row.number(&metric.key));
                    summary.insert(metric.key.clone(), value);
                } else if !catalog.is_metric(&metric.key) {
                    catalog.register_metric(&metric.key, &metric.label, metric.kind)?;
                }
            }
        }

        let groups = aggregate(&rows, &catalog, query)?;
        let kpis = totals(&rows, &catalog, query);

        let mut columns: Vec<FieldSpec> = query
            .group_by
            .iter()
            .filter_map(|key| catalog.dimensions().iter().find(|d| &d.key == key).cloned())
            .collect();
        columns.extend(catalog.metrics().iter().cloned());
        columns.extend(query.derived.iter().map(|metric| FieldSpec {
            key: metric.key().to_string(),
            label: metric.label().to_string(),
            kind: metric.kind(),
        }));

        if snapshot.is_partial() {
            warn!(
                view = self.kind.key(),
                rows = rows.len(),
                "rendering partial rows after a failed load"
            );
        }

        Ok(ViewReport {
            view: self.kind,
            status: status_label(snapshot.status),
            partial: snapshot.is_partial(),
            error: snapshot.error.clone(),
            rows_loaded: rows.len(),
            total_known: snapshot.total_known,
            elapsed_seconds: snapshot.elapsed_seconds,
            columns,
            totals: kpis,
            summary,
            groups,
        })
    }
}

/// Logs progress changes of the job's generation until it settles or the
/// job is cancelled.
async fn follow(
    kind: ViewKind,
    state: &ViewState,
    handle: &JobHandle,
) -> Result<ViewSnapshot, ViewError> {
    let generation = handle.generation;
    let mut rx = state.subscribe();
    let mut last_progress = String::new();
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if snapshot.generation != generation {
            return Err(ViewError::Superseded);
        }
        if snapshot.is_settled() {
            return Ok(snapshot);
        }
        if snapshot.progress != last_progress {
            info!(
                view = kind.key(),
                progress = %snapshot.progress,
                retry = snapshot.retry_count,
                "view progress"
            );
            last_progress = snapshot.progress;
        }
        tokio::select! {
            biased;
            _ = handle.cancelled() => {
                if !state.is_current(generation) {
                    return Err(ViewError::Superseded);
                }
                debug!(view = kind.key(), job_id = %handle.job_id, "job view cancelled");
                return Err(ViewError::Cancelled);
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(state.snapshot());
                }
            }
        }
    }
}

fn status_label(status: LoadStatus) -> &'static str {
    match status {
        LoadStatus::Idle => "idle",
        LoadStatus::Loading => "loading",
        LoadStatus::Ready => "ready",
        LoadStatus::Failed => "failed",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewReport {
    pub view: ViewKind,
    pub status: &'static str,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub rows_loaded: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_known: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    pub columns: Vec<FieldSpec>,
    pub totals: Group,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub summary: BTreeMap<String, f64>,
    pub groups: Vec<Group>,
}

impl ViewReport {
    pub fn is_failed(&self) -> bool {
        self.status == "failed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregation::{DerivedMetric, SortSpec};
    use metrics_sdk::scripted::ScriptedFailure;
    use metrics_sdk::{
        JobResult, JobStatus, JobStatusReport, JobTicket, Page, RawRow, ScriptedBackend,
    };
    use std::time::Duration;

    fn overview_rows() -> Vec<RawRow> {
        vec![
            RawRow::new()
                .with("platform", "google")
                .with("sessions", 100)
                .with("orders", 4)
                .with("revenue", 400.0)
                .with("cost", 100),
            RawRow::new()
                .with("platform", "meta")
                .with("sessions", 50)
                .with("orders", 1)
                .with("revenue", 90.0)
                .with("cost", 0),
            RawRow::new()
                .with("platform", "google")
                .with("sessions", 20)
                .with("orders", 2)
                .with("revenue", 100.0)
                .with("cost", 25),
        ]
    }

    fn fast_jobs() -> JobConfig {
        JobConfig {
            poll_interval: Duration::from_secs(1),
            result_retry: RetryPolicy::new(3, Duration::from_secs(1)),
            max_poll_duration: None,
        }
    }

    #[test]
    fn view_catalogs_register_their_columns() {
        let products = ViewKind::Products.catalog().unwrap();
        assert!(products.is_dimension("trend_status"));
        assert!(products.is_metric("purchases_week_4"));

        let orders = ViewKind::Orders.catalog().unwrap();
        assert!(orders.is_dimension("Canal"));
        assert!(orders.is_metric("Receita"));
        assert!(!orders.is_dimension("influencer_name"));

        for kind in ViewKind::value_variants() {
            let catalog = kind.catalog().unwrap();
            for key in kind.default_group_by() {
                assert!(catalog.is_dimension(key), "{key} missing from {kind:?}");
            }
        }
    }

    #[test]
    fn orders_are_paged_and_the_rest_are_jobs() {
        assert_eq!(ViewKind::Orders.source(), Source::Paged("/metrics/orders"));
        assert_eq!(
            ViewKind::Influencers.source(),
            Source::Job(JobRoutes::new("/influencers"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn job_view_loads_and_renders_groups() {
        let backend = ScriptedBackend::new();
        backend.push_ticket(JobTicket::for_job("job-1"));
        backend.push_status("job-1", JobStatusReport::new(JobStatus::Processing));
        backend.push_status(
            "job-1",
            JobStatusReport::new(JobStatus::Completed).with_elapsed(2.0),
        );
        backend.push_result(
            "job-1",
            JobResult {
                data: overview_rows(),
                count: Some(3),
            },
        );

        let binding =
            ViewBinding::with_jobs(ViewKind::Overview, backend.clone(), fast_jobs()).unwrap();
        let params = QueryParameters::new("acme").unwrap();
        let snapshot = binding.load(params).await.unwrap();
        assert_eq!(snapshot.status, LoadStatus::Ready);

        let query = GroupQuery::group_by(["platform"])
            .with_derived([DerivedMetric::Roas])
            .sorted_by(SortSpec::desc("revenue"));
        let report = binding.render(&snapshot, &query, &[]).unwrap();
        assert_eq!(report.status, "ready");
        assert!(!report.partial);
        assert_eq!(report.rows_loaded, 3);
        assert_eq!(report.groups.len(), 2);
        assert_eq!(report.groups[0].key, vec!["google"]);
        assert_eq!(report.groups[0].metric("revenue"), 500.0);
        assert_eq!(report.groups[0].metric("roas"), 4.0);
        assert_eq!(report.totals.metric("orders"), 7.0);
        assert_eq!(report.columns[0].key, "platform");
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_submit_renders_failed_report() {
        let backend = ScriptedBackend::new();
        backend.push_submit_failure(ScriptedFailure::Unauthorized);

        let binding = ViewBinding::with_jobs(ViewKind::Products, backend, fast_jobs()).unwrap();
        let snapshot = binding
            .load(QueryParameters::new("acme").unwrap())
            .await
            .unwrap();
        let report = binding
            .render(&snapshot, &GroupQuery::group_by(["item_name"]), &[])
            .unwrap();
        assert!(report.is_failed());
        assert!(report.groups.is_empty());
        assert!(report.error.unwrap().contains("failed to start processing"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_polling_job_view_ends_the_load() {
        let backend = ScriptedBackend::new();
        let binding =
            ViewBinding::with_jobs(ViewKind::Overview, backend.clone(), fast_jobs()).unwrap();

        let params = QueryParameters::new("acme").unwrap();
        let (loaded, ()) = tokio::join!(binding.load(params), async {
            tokio::time::sleep(Duration::from_secs(4)).await;
            binding.cancel();
        });
        assert!(matches!(loaded, Err(ViewError::Cancelled)));
        assert!(backend.status_calls("job-1") >= 4);
        assert_eq!(binding.state().snapshot().status, LoadStatus::Loading);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_job_view_mid_submit_ends_the_load() {
        let backend = ScriptedBackend::new();
        backend.set_submit_latency(Duration::from_secs(2));
        let binding =
            ViewBinding::with_jobs(ViewKind::Products, backend.clone(), fast_jobs()).unwrap();

        let params = QueryParameters::new("acme").unwrap();
        let (loaded, ()) = tokio::join!(binding.load(params), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            binding.cancel();
        });
        assert!(matches!(loaded, Err(ViewError::Cancelled)));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.status_calls("job-1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn paged_view_keeps_partial_rows() {
        let backend = ScriptedBackend::new();
        backend.push_page(
            "acme",
            0,
            Page {
                data: vec![
                    RawRow::new().with("Canal", "Pago").with("Receita", "1.000,00"),
                    RawRow::new().with("Canal", "Organico").with("Receita", 250),
                ],
                total_rows: Some(4),
            },
        );
        backend.push_page_failure(
            "acme",
            2,
            ScriptedFailure::Status(500),
        );

        let binding = ViewBinding::with_pages(
            ViewKind::Orders,
            backend,
            RetryPolicy::page_fetch(),
            NonZeroU32::new(2).unwrap(),
        )
        .unwrap();
        let snapshot = binding
            .load(QueryParameters::new("acme").unwrap())
            .await
            .unwrap();
        let report = binding
            .render(&snapshot, &GroupQuery::group_by(["Canal"]), &[])
            .unwrap();
        assert!(report.partial);
        assert_eq!(report.rows_loaded, 2);
        assert_eq!(report.totals.metric("Receita"), 1_250.0);
        assert_eq!(report.total_known, Some(4));
    }

    #[test]
    fn calculated_metrics_become_columns_or_summary() {
        let binding = ViewBinding::with_jobs(
            ViewKind::Overview,
            ScriptedBackend::new(),
            JobConfig::default(),
        )
        .unwrap();
        let snapshot = ViewSnapshot {
            status: LoadStatus::Ready,
            rows: Arc::new(overview_rows()),
            ..ViewSnapshot::default()
        };
        let calculated = vec![
            CalculatedMetric::new("profit", "Profit", ValueKind::Currency, "revenue - cost"),
            CalculatedMetric::new(
                "avg_ticket",
                "Avg ticket",
                ValueKind::Currency,
                "sum(revenue) / sum(orders)",
            ),
        ];
        let query = GroupQuery::group_by(["platform"]).sorted_by(SortSpec::desc("profit"));
        let report = binding.render(&snapshot, &query, &calculated).unwrap();

        assert_eq!(report.groups[0].key, vec!["google"]);
        assert_eq!(report.groups[0].metric("profit"), 375.0);
        assert!(report.columns.iter().any(|c| c.key == "profit"));
        assert!(!report.columns.iter().any(|c| c.key == "avg_ticket"));
        assert_eq!(report.summary["avg_ticket"], 590.0 / 7.0);
        assert!(binding.catalog().is_metric("revenue"));
        assert!(!binding.catalog().is_metric("profit"));
    }
}
