use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Placeholder rendered for a dimension the row does not carry.
pub const MISSING_DIMENSION: &str = "-";

/// One flat record returned by the metrics backend.
///
/// Rows are kept as the raw JSON object so views with different schemas
/// (overview, influencers, orders, products) share a single type. Field
/// access goes through [`RawRow::text`] and [`RawRow::number`], which apply
/// the lenient conversions the dashboards rely on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow(Map<String, Value>);

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Builder-style setter, mostly useful for fixtures.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// String view of a dimension field. Numbers and booleans are rendered,
    /// null/absent/blank values collapse to `None`.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.0.get(field)? {
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Dimension value as displayed and filtered: missing values read as `-`.
    pub fn dimension_value(&self, field: &str) -> String {
        self.text(field)
            .unwrap_or_else(|| MISSING_DIMENSION.to_string())
    }

    /// Numeric view of a metric field; anything unusable reads as `0.0`.
    pub fn number(&self, field: &str) -> f64 {
        match self.0.get(field) {
            Some(Value::Number(n)) => n.as_f64().filter(|v| v.is_finite()).unwrap_or(0.0),
            Some(Value::String(s)) => parse_lenient_number(s).unwrap_or(0.0),
            Some(Value::Bool(true)) => 1.0,
            _ => 0.0,
        }
    }
}

impl From<Map<String, Value>> for RawRow {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

/// Parses plain decimal strings and, failing that, Brazilian-formatted
/// amounts such as `1.234,56`.
pub fn parse_lenient_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        return v.is_finite().then_some(v);
    }
    let normalized = trimmed.replace('.', "").replacen(',', ".", 1);
    normalized
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}
