//! Binds one dashboard view to the retrieval core and renders its grouped
//! table. The binary in `main.rs` is a thin shell over [`views::ViewBinding`].

pub mod cli;
pub mod config;
pub mod telemetry;
pub mod views;

pub use cli::{Cli, ViewRequest};
pub use config::AppConfig;
pub use views::{ViewBinding, ViewError, ViewKind, ViewReport};
