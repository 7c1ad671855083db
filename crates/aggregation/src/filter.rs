use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use metrics_sdk::RawRow;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Allowed values per dimension. AND across dimensions, OR within one.
/// Values are compared against the rendered dimension value, so a missing
/// field matches `"-"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DimensionFilters(BTreeMap<String, BTreeSet<String>>);

impl DimensionFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `values` to the allowed set of `dimension`. An empty iterator
    /// leaves the filters unchanged.
    pub fn allow<I, V>(mut self, dimension: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        if !values.is_empty() {
            self.0.entry(dimension.into()).or_default().extend(values);
        }
        self
    }

    /// Click-to-filter: selects `value` if absent, deselects it otherwise.
    /// A dimension whose last value is removed stops constraining rows.
    /// Returns whether the value is selected afterwards.
    pub fn toggle(&mut self, dimension: &str, value: &str) -> bool {
        let values = self.0.entry(dimension.to_string()).or_default();
        let selected = if values.remove(value) {
            false
        } else {
            values.insert(value.to_string());
            true
        };
        if values.is_empty() {
            self.0.remove(dimension);
        }
        selected
    }

    pub fn clear(&mut self, dimension: &str) {
        self.0.remove(dimension);
    }

    pub fn clear_all(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn allowed(&self, dimension: &str) -> Option<&BTreeSet<String>> {
        self.0.get(dimension)
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn matches(&self, row: &RawRow) -> bool {
        self.0
            .iter()
            .all(|(dimension, allowed)| allowed.contains(&row.dimension_value(dimension)))
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("invalid date {value:?}: expected YYYY-MM-DD")]
    InvalidDate { value: String },
    #[error("date window starts after it ends ({start} > {end})")]
    Inverted { start: NaiveDate, end: NaiveDate },
}

/// Inclusive client-side date range over an ISO date field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub field: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(
        field: impl Into<String>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Self, FilterError> {
        if start > end {
            return Err(FilterError::Inverted { start, end });
        }
        Ok(Self {
            field: field.into(),
            start,
            end,
        })
    }

    pub fn parse(field: impl Into<String>, start: &str, end: &str) -> Result<Self, FilterError> {
        Self::new(field, parse_date(start)?, parse_date(end)?)
    }

    /// Rows without a parseable date fall outside every window.
    pub fn contains(&self, row: &RawRow) -> bool {
        row.text(&self.field)
            .and_then(|raw| row_date(&raw))
            .map(|date| self.start <= date && date <= self.end)
            .unwrap_or(false)
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate, FilterError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|_| FilterError::InvalidDate {
        value: value.to_string(),
    })
}

/// Accepts `2024-03-01` as well as timestamps such as `2024-03-01T10:00:00Z`.
fn row_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.trim().get(..10)?;
    NaiveDate::parse_from_str(day, DATE_FORMAT).ok()
}
