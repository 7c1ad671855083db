use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a metric value is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Number,
    Currency,
    Percentage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    EventDate,
    Platform,
    TrafficCategory,
    City,
    Region,
    Country,
}

impl Dimension {
    pub const ALL: [Dimension; 6] = [
        Dimension::EventDate,
        Dimension::Platform,
        Dimension::TrafficCategory,
        Dimension::City,
        Dimension::Region,
        Dimension::Country,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Dimension::EventDate => "event_date",
            Dimension::Platform => "platform",
            Dimension::TrafficCategory => "traffic_category",
            Dimension::City => "city",
            Dimension::Region => "region",
            Dimension::Country => "country",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Dimension::EventDate => "Date",
            Dimension::Platform => "Platform",
            Dimension::TrafficCategory => "Traffic category",
            Dimension::City => "City",
            Dimension::Region => "Region",
            Dimension::Country => "Country",
        }
    }
}

/// Additive metrics read from rows and summed per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseMetric {
    Sessions,
    Clicks,
    AddToCarts,
    Orders,
    PaidOrders,
    Revenue,
    PaidRevenue,
    Cost,
    Leads,
    NewCustomers,
    RevenueNewCustomers,
}

impl BaseMetric {
    pub const ALL: [BaseMetric; 11] = [
        BaseMetric::Sessions,
        BaseMetric::Clicks,
        BaseMetric::AddToCarts,
        BaseMetric::Orders,
        BaseMetric::PaidOrders,
        BaseMetric::Revenue,
        BaseMetric::PaidRevenue,
        BaseMetric::Cost,
        BaseMetric::Leads,
        BaseMetric::NewCustomers,
        BaseMetric::RevenueNewCustomers,
    ];

    pub fn key(self) -> &'static str {
        match self {
            BaseMetric::Sessions => "sessions",
            BaseMetric::Clicks => "clicks",
            BaseMetric::AddToCarts => "add_to_carts",
            BaseMetric::Orders => "orders",
            BaseMetric::PaidOrders => "paid_orders",
            BaseMetric::Revenue => "revenue",
            BaseMetric::PaidRevenue => "paid_revenue",
            BaseMetric::Cost => "cost",
            BaseMetric::Leads => "leads",
            BaseMetric::NewCustomers => "new_customers",
            BaseMetric::RevenueNewCustomers => "revenue_new_customers",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            BaseMetric::Sessions => "Sessions",
            BaseMetric::Clicks => "Clicks",
            BaseMetric::AddToCarts => "Add to carts",
            BaseMetric::Orders => "Orders",
            BaseMetric::PaidOrders => "Paid orders",
            BaseMetric::Revenue => "Revenue",
            BaseMetric::PaidRevenue => "Paid revenue",
            BaseMetric::Cost => "Cost",
            BaseMetric::Leads => "Leads",
            BaseMetric::NewCustomers => "New customers",
            BaseMetric::RevenueNewCustomers => "New customer revenue",
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            BaseMetric::Revenue
            | BaseMetric::PaidRevenue
            | BaseMetric::Cost
            | BaseMetric::RevenueNewCustomers => ValueKind::Currency,
            _ => ValueKind::Number,
        }
    }
}

/// Ratios computed from a group's summed base metrics, never from per-row
/// ratios. A zero denominator yields 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedMetric {
    ConversionRate,
    AddToCartRate,
    LeadsConversionRate,
    PaidConversionRate,
    RevenuePerSession,
    AvgOrderValue,
    Roas,
    NewCustomerRate,
}

impl DerivedMetric {
    pub const ALL: [DerivedMetric; 8] = [
        DerivedMetric::ConversionRate,
        DerivedMetric::AddToCartRate,
        DerivedMetric::LeadsConversionRate,
        DerivedMetric::PaidConversionRate,
        DerivedMetric::RevenuePerSession,
        DerivedMetric::AvgOrderValue,
        DerivedMetric::Roas,
        DerivedMetric::NewCustomerRate,
    ];

    pub fn key(self) -> &'static str {
        match self {
            DerivedMetric::ConversionRate => "conversion_rate",
            DerivedMetric::AddToCartRate => "add_to_cart_rate",
            DerivedMetric::LeadsConversionRate => "leads_conversion_rate",
            DerivedMetric::PaidConversionRate => "paid_conversion_rate",
            DerivedMetric::RevenuePerSession => "revenue_per_session",
            DerivedMetric::AvgOrderValue => "avg_order_value",
            DerivedMetric::Roas => "roas",
            DerivedMetric::NewCustomerRate => "new_customer_rate",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DerivedMetric::ConversionRate => "Conversion rate",
            DerivedMetric::AddToCartRate => "Add to cart rate",
            DerivedMetric::LeadsConversionRate => "Lead conversion rate",
            DerivedMetric::PaidConversionRate => "Payment rate",
            DerivedMetric::RevenuePerSession => "Revenue per session",
            DerivedMetric::AvgOrderValue => "Average order value",
            DerivedMetric::Roas => "ROAS",
            DerivedMetric::NewCustomerRate => "New customer rate",
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            DerivedMetric::RevenuePerSession | DerivedMetric::AvgOrderValue => ValueKind::Currency,
            DerivedMetric::Roas => ValueKind::Number,
            _ => ValueKind::Percentage,
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|metric| metric.key() == key)
    }

    /// Evaluates the formula against summed base metrics.
    pub fn compute(self, sum: impl Fn(BaseMetric) -> f64) -> f64 {
        use BaseMetric::*;
        match self {
            DerivedMetric::ConversionRate => percent(sum(Orders), sum(Sessions)),
            DerivedMetric::AddToCartRate => percent(sum(AddToCarts), sum(Sessions)),
            DerivedMetric::LeadsConversionRate => percent(sum(Leads), sum(Sessions)),
            DerivedMetric::PaidConversionRate => percent(sum(PaidOrders), sum(Orders)),
            DerivedMetric::RevenuePerSession => ratio(sum(Revenue), sum(Sessions)),
            DerivedMetric::AvgOrderValue => ratio(sum(Revenue), sum(Orders)),
            DerivedMetric::Roas => ratio(sum(Revenue), sum(Cost)),
            DerivedMetric::NewCustomerRate => percent(sum(NewCustomers), sum(Orders)),
        }
    }
}

impl fmt::Display for DerivedMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

pub(crate) fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        return 0.0;
    }
    let value = numerator / denominator;
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn percent(numerator: f64, denominator: f64) -> f64 {
    ratio(numerator, denominator) * 100.0
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown dimension {0:?}")]
    UnknownDimension(String),
    #[error("unknown metric {0:?}")]
    UnknownMetric(String),
    #[error("field {0:?} is already registered")]
    Duplicate(String),
    #[error("field names must be non-empty identifiers, got {0:?}")]
    InvalidKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub key: String,
    pub label: String,
    pub kind: ValueKind,
}

/// A resolved sort or display key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Dimension(String),
    Metric(String),
    Derived(DerivedMetric),
}

/// Dimensions and additive metrics known to a view. Starts from the
/// standard vocabulary; tables with extra columns register them.
#[derive(Debug, Clone)]
pub struct Catalog {
    dimensions: Vec<FieldSpec>,
    metrics: Vec<FieldSpec>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl Catalog {
    pub fn standard() -> Self {
        Self {
            dimensions: Dimension::ALL
                .into_iter()
                .map(|d| FieldSpec {
                    key: d.key().to_string(),
                    label: d.label().to_string(),
                    kind: ValueKind::Number,
                })
                .collect(),
            metrics: BaseMetric::ALL
                .into_iter()
                .map(|m| FieldSpec {
                    key: m.key().to_string(),
                    label: m.label().to_string(),
                    kind: m.kind(),
                })
                .collect(),
        }
    }

    pub fn register_dimension(
        &mut self,
        key: impl Into<String>,
        label: impl Into<String>,
    ) -> Result<(), CatalogError> {
        let key = self.checked_key(key.into())?;
        self.dimensions.push(FieldSpec {
            key,
            label: label.into(),
            kind: ValueKind::Number,
        });
        Ok(())
    }

    pub fn register_metric(
        &mut self,
        key: impl Into<String>,
        label: impl Into<String>,
        kind: ValueKind,
    ) -> Result<(), CatalogError> {
        let key = self.checked_key(key.into())?;
        self.metrics.push(FieldSpec {
            key,
            label: label.into(),
            kind,
        });
        Ok(())
    }

    pub fn dimensions(&self) -> &[FieldSpec] {
        &self.dimensions
    }

    /// Summed metrics, standard ones first, in registration order.
    pub fn metrics(&self) -> &[FieldSpec] {
        &self.metrics
    }

    pub fn is_dimension(&self, key: &str) -> bool {
        self.dimensions.iter().any(|d| d.key == key)
    }

    pub fn is_metric(&self, key: &str) -> bool {
        self.metrics.iter().any(|m| m.key == key)
    }

    pub fn require_dimension(&self, key: &str) -> Result<(), CatalogError> {
        if self.is_dimension(key) {
            Ok(())
        } else {
            Err(CatalogError::UnknownDimension(key.to_string()))
        }
    }

    pub fn resolve(&self, key: &str) -> Result<Field, CatalogError> {
        if self.is_dimension(key) {
            return Ok(Field::Dimension(key.to_string()));
        }
        if self.is_metric(key) {
            return Ok(Field::Metric(key.to_string()));
        }
        DerivedMetric::from_key(key)
            .map(Field::Derived)
            .ok_or_else(|| CatalogError::UnknownMetric(key.to_string()))
    }

    fn checked_key(&self, key: String) -> Result<String, CatalogError> {
        let valid = key
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(CatalogError::InvalidKey(key));
        }
        if self.is_dimension(&key) || self.is_metric(&key) || DerivedMetric::from_key(&key).is_some()
        {
            return Err(CatalogError::Duplicate(key));
        }
        Ok(key)
    }
}
