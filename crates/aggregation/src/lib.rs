//! Client-side shaping of dashboard rows: filtering, grouping by a dimension
//! tuple, summed and derived metrics, sorting, totals and user-defined
//! calculated metrics. Everything here is synchronous and pure.

pub mod aggregate;
pub mod catalog;
pub mod filter;
pub mod formula;

pub use aggregate::{aggregate, totals, Group, GroupQuery, SortDirection, SortSpec};
pub use catalog::{BaseMetric, Catalog, CatalogError, DerivedMetric, Dimension, Field, FieldSpec, ValueKind};
pub use filter::{DateWindow, DimensionFilters, FilterError};
pub use formula::{apply_calculated_metrics, CalculatedMetric, Formula, FormulaError};
