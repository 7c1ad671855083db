use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use metrics_sdk::RawRow;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{BaseMetric, Catalog, CatalogError, DerivedMetric, Field};
use crate::filter::{DateWindow, DimensionFilters};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub key: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Everything that shapes a grouped table besides the rows themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupQuery {
    pub filters: DimensionFilters,
    pub window: Option<DateWindow>,
    pub group_by: Vec<String>,
    pub derived: Vec<DerivedMetric>,
    pub sort: Option<SortSpec>,
    pub limit: Option<usize>,
}

impl GroupQuery {
    pub fn group_by<I, S>(dimensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            group_by: dimensions.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_filters(mut self, filters: DimensionFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_window(mut self, window: DateWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_derived(mut self, derived: impl IntoIterator<Item = DerivedMetric>) -> Self {
        self.derived = derived.into_iter().collect();
        self
    }

    pub fn sorted_by(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn limited_to(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn passes(&self, row: &RawRow) -> bool {
        self.filters.matches(row)
            && self.window.as_ref().map_or(true, |window| window.contains(row))
    }
}

/// One output row: the grouping tuple and its metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Group {
    pub key: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
}

impl Group {
    /// Missing metrics read as 0.
    pub fn metric(&self, key: &str) -> f64 {
        self.metrics.get(key).copied().unwrap_or(0.0)
    }
}

struct Accumulator {
    key: Vec<String>,
    sums: Vec<f64>,
}

impl Accumulator {
    fn new(key: Vec<String>, width: usize) -> Self {
        Self {
            key,
            sums: vec![0.0; width],
        }
    }

    fn add(&mut self, catalog: &Catalog, row: &RawRow) {
        for (sum, metric) in self.sums.iter_mut().zip(catalog.metrics()) {
            *sum += row.number(&metric.key);
        }
    }

    fn finish(self, catalog: &Catalog, derived: &[DerivedMetric]) -> Group {
        let mut metrics: BTreeMap<String, f64> = catalog
            .metrics()
            .iter()
            .zip(self.sums)
            .map(|(metric, sum)| (metric.key.clone(), sum))
            .collect();
        for metric in derived {
            let value = metric.compute(|base: BaseMetric| {
                metrics.get(base.key()).copied().unwrap_or(0.0)
            });
            metrics.insert(metric.key().to_string(), value);
        }
        Group {
            key: self.key,
            metrics,
        }
    }
}

/// Filters `rows`, groups them by `query.group_by`, sums every catalog
/// metric per group and derives the requested ratios from those sums.
///
/// Groups come out in first-seen order unless a sort is requested. Sorting
/// on a dimension that is not grouped leaves that order alone.
pub fn aggregate(
    rows: &[RawRow],
    catalog: &Catalog,
    query: &GroupQuery,
) -> Result<Vec<Group>, CatalogError> {
    for dimension in &query.group_by {
        catalog.require_dimension(dimension)?;
    }
    for dimension in query.filters.dimensions() {
        catalog.require_dimension(dimension)?;
    }
    let sort = query
        .sort
        .as_ref()
        .map(|spec| catalog.resolve(&spec.key).map(|field| (field, spec.direction)))
        .transpose()?;

    let mut derived = query.derived.clone();
    if let Some((Field::Derived(metric), _)) = &sort {
        if !derived.contains(metric) {
            derived.push(*metric);
        }
    }

    let width = catalog.metrics().len();
    let mut slots: HashMap<Vec<String>, usize> = HashMap::new();
    let mut groups: Vec<Accumulator> = Vec::new();
    let mut matched = 0usize;
    for row in rows.iter().filter(|row| query.passes(row)) {
        matched += 1;
        let key: Vec<String> = query
            .group_by
            .iter()
            .map(|dimension| row.dimension_value(dimension))
            .collect();
        let slot = match slots.get(&key) {
            Some(&slot) => slot,
            None => {
                slots.insert(key.clone(), groups.len());
                groups.push(Accumulator::new(key, width));
                groups.len() - 1
            }
        };
        groups[slot].add(catalog, row);
    }

    let mut groups: Vec<Group> = groups
        .into_iter()
        .map(|acc| acc.finish(catalog, &derived))
        .collect();

    if let Some((field, direction)) = sort {
        sort_groups(&mut groups, &query.group_by, &field, direction);
    }
    if let Some(limit) = query.limit {
        groups.truncate(limit);
    }

    debug!(
        rows = rows.len(),
        matched,
        groups = groups.len(),
        "rows aggregated"
    );
    Ok(groups)
}

/// KPI totals: every row passing the query's filters summed into one
/// group with an empty key. Grouping, sort and limit are ignored.
pub fn totals(rows: &[RawRow], catalog: &Catalog, query: &GroupQuery) -> Group {
    let mut acc = Accumulator::new(Vec::new(), catalog.metrics().len());
    for row in rows.iter().filter(|row| query.passes(row)) {
        acc.add(catalog, row);
    }
    acc.finish(catalog, &query.derived)
}

fn sort_groups(groups: &mut [Group], group_by: &[String], field: &Field, direction: SortDirection) {
    let ordering: Box<dyn Fn(&Group, &Group) -> Ordering> = match field {
        Field::Dimension(dimension) => {
            let Some(position) = group_by.iter().position(|d| d == dimension) else {
                return;
            };
            Box::new(move |a: &Group, b: &Group| {
                a.key[position]
                    .to_lowercase()
                    .cmp(&b.key[position].to_lowercase())
            })
        }
        Field::Metric(key) => {
            let key = key.clone();
            Box::new(move |a: &Group, b: &Group| a.metric(&key).total_cmp(&b.metric(&key)))
        }
        Field::Derived(metric) => {
            let key = metric.key();
            Box::new(move |a: &Group, b: &Group| a.metric(key).total_cmp(&b.metric(key)))
        }
    };
    // `sort_by` is stable, so equal keys keep first-seen order either way.
    match direction {
        SortDirection::Asc => groups.sort_by(|a, b| ordering(a, b)),
        SortDirection::Desc => groups.sort_by(|a, b| ordering(b, a)),
    }
}
