use anyhow::{bail, Context, Result};
use clap::Parser;
use dashboard_sync::config::AppConfig;
use dashboard_sync::telemetry::init_tracing;
use dashboard_sync::{Cli, ViewBinding};
use metrics_sdk::MetricsClient;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cfg = AppConfig::from_env();
    init_tracing(&cfg.log_filter);

    let cli = Cli::parse();
    let pretty = cli.pretty;
    let request = cli.into_request().context("invalid arguments")?;
    let token = cfg
        .api_token
        .clone()
        .context("DASHBOARD_API_TOKEN is not set")?;

    info!(
        api = %cfg.api_url,
        view = request.view.key(),
        table = %request.parameters.table_name,
        poll_interval_ms = cfg.poll_interval_ms,
        max_poll_secs = ?cfg.max_poll_secs,
        page_size = cfg.page_size.get(),
        "starting dashboard-sync"
    );

    let client = MetricsClient::new(&cfg.api_url, token);
    let binding = ViewBinding::for_client(request.view, &client, &cfg)?;

    let snapshot = tokio::select! {
        loaded = binding.load(request.parameters.clone()) => loaded?,
        _ = signal::ctrl_c() => {
            warn!(view = request.view.key(), "interrupted; cancelling load");
            binding.cancel();
            return Ok(());
        }
    };

    let report = binding.render(&snapshot, &request.query, &request.calculated)?;
    let rendered = if pretty {
        serde_json::to_string_pretty(&report)
    } else {
        serde_json::to_string(&report)
    }
    .context("serialize report")?;
    println!("{rendered}");

    if report.is_failed() {
        bail!(
            "view {} failed: {}",
            request.view.key(),
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
