use aggregation::{
    CalculatedMetric, DateWindow, DerivedMetric, DimensionFilters, GroupQuery, SortDirection,
    SortSpec, ValueKind,
};
use clap::Parser;
use metrics_sdk::QueryParameters;

use crate::views::{ViewError, ViewKind};

#[derive(Debug, Parser)]
#[command(
    name = "dashboard-sync",
    author,
    version,
    about = "Load one dashboard view from the metrics API and print its grouped table"
)]
pub struct Cli {
    /// Dashboard view to load.
    #[arg(long, value_enum, default_value = "overview")]
    pub view: ViewKind,

    /// Client table to query.
    #[arg(long, env = "DASHBOARD_TABLE")]
    pub table: String,

    /// First day of the range (YYYY-MM-DD).
    #[arg(long)]
    pub start: Option<String>,

    /// Last day of the range (YYYY-MM-DD).
    #[arg(long)]
    pub end: Option<String>,

    /// Dimensions to group by, comma separated. Defaults per view.
    #[arg(long, value_delimiter = ',')]
    pub group_by: Vec<String>,

    /// Derived metrics to compute, comma separated, or `all`.
    #[arg(long, value_delimiter = ',')]
    pub derived: Vec<String>,

    /// Metric or grouped dimension to sort by.
    #[arg(long)]
    pub sort: Option<String>,

    /// Sort ascending instead of descending.
    #[arg(long, default_value_t = false)]
    pub asc: bool,

    /// Keep only rows where `dimension=value`. Repeatable; values of the
    /// same dimension are alternatives.
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    /// Maximum number of groups to print.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Also filter rows client-side to the start/end range.
    #[arg(long, default_value_t = false)]
    pub window: bool,

    /// Calculated metric as `key[:kind]=formula`, e.g.
    /// `profit:currency=revenue - cost`. Repeatable.
    #[arg(long = "calc")]
    pub calculated: Vec<String>,

    /// Pretty-print the JSON report.
    #[arg(long, default_value_t = false)]
    pub pretty: bool,
}

/// Everything one run needs: what to fetch and how to shape it.
#[derive(Debug, Clone)]
pub struct ViewRequest {
    pub view: ViewKind,
    pub parameters: QueryParameters,
    pub query: GroupQuery,
    pub calculated: Vec<CalculatedMetric>,
}

impl Cli {
    pub fn into_request(self) -> Result<ViewRequest, ViewError> {
        let mut parameters = QueryParameters::new(&self.table)?;
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => parameters = parameters.with_dates(start, end),
            (None, None) => {}
            _ => {
                return Err(ViewError::InvalidArgument(
                    "--start and --end must be given together".into(),
                ))
            }
        }

        let group_by: Vec<String> = if self.group_by.is_empty() {
            self.view
                .default_group_by()
                .iter()
                .map(|key| key.to_string())
                .collect()
        } else {
            self.group_by.iter().map(|key| key.trim().to_string()).collect()
        };
        let mut query = GroupQuery::group_by(group_by)
            .with_filters(parse_filters(&self.filters)?)
            .with_derived(parse_derived(&self.derived)?);

        if let Some(key) = self.sort.as_deref() {
            query = query.sorted_by(SortSpec {
                key: key.trim().to_string(),
                direction: if self.asc {
                    SortDirection::Asc
                } else {
                    SortDirection::Desc
                },
            });
        }
        if let Some(limit) = self.limit {
            query = query.limited_to(limit);
        }
        if self.window {
            let field = self.view.date_field().ok_or_else(|| {
                ViewError::InvalidArgument(format!("view {} has no date field", self.view.key()))
            })?;
            let (Some(start), Some(end)) = (&self.start, &self.end) else {
                return Err(ViewError::InvalidArgument(
                    "--window needs --start and --end".into(),
                ));
            };
            query = query.with_window(DateWindow::parse(field, start, end)?);
        }

        let calculated = self
            .calculated
            .iter()
            .map(|raw| parse_calculated(raw))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ViewRequest {
            view: self.view,
            parameters,
            query,
            calculated,
        })
    }
}

fn parse_filters(raw: &[String]) -> Result<DimensionFilters, ViewError> {
    let mut filters = DimensionFilters::new();
    for entry in raw {
        let (dimension, value) = entry.split_once('=').ok_or_else(|| {
            ViewError::InvalidArgument(format!("filter {entry:?} is not dimension=value"))
        })?;
        let dimension = dimension.trim();
        if dimension.is_empty() {
            return Err(ViewError::InvalidArgument(format!(
                "filter {entry:?} has no dimension"
            )));
        }
        filters = filters.allow(dimension, [value.trim()]);
    }
    Ok(filters)
}

fn parse_derived(raw: &[String]) -> Result<Vec<DerivedMetric>, ViewError> {
    let mut derived = Vec::new();
    for key in raw.iter().map(|key| key.trim()).filter(|key| !key.is_empty()) {
        if key == "all" {
            return Ok(DerivedMetric::ALL.to_vec());
        }
        let metric = DerivedMetric::from_key(key)
            .ok_or_else(|| ViewError::InvalidArgument(format!("unknown derived metric {key:?}")))?;
        if !derived.contains(&metric) {
            derived.push(metric);
        }
    }
    Ok(derived)
}

fn parse_calculated(raw: &str) -> Result<CalculatedMetric, ViewError> {
    let (head, formula) = raw.split_once('=').ok_or_else(|| {
        ViewError::InvalidArgument(format!("calculated metric {raw:?} is not key=formula"))
    })?;
    let (key, kind) = match head.split_once(':') {
        Some((key, kind)) => (key.trim(), parse_kind(kind.trim())?),
        None => (head.trim(), ValueKind::Number),
    };
    if key.is_empty() || formula.trim().is_empty() {
        return Err(ViewError::InvalidArgument(format!(
            "calculated metric {raw:?} needs a key and a formula"
        )));
    }
    Ok(CalculatedMetric::new(key, key, kind, formula.trim()))
}

fn parse_kind(raw: &str) -> Result<ValueKind, ViewError> {
    match raw {
        "number" => Ok(ValueKind::Number),
        "currency" => Ok(ValueKind::Currency),
        "percentage" | "percent" => Ok(ValueKind::Percentage),
        other => Err(ViewError::InvalidArgument(format!(
            "unknown value kind {other:?}"
        ))),
    }
}
