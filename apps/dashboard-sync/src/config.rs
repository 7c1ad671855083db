use std::num::NonZeroU32;
use std::time::Duration;

use retrieval::{JobConfig, RetryPolicy};

pub const DEFAULT_API_URL: &str = "https://api.mymetric.app";
pub const DEFAULT_LOG_FILTER: &str = "info,dashboard_sync=debug,retrieval=debug";
/// Rows requested per page by paged views.
pub const DEFAULT_PAGE_SIZE: NonZeroU32 = match NonZeroU32::new(100) {
    Some(size) => size,
    None => panic!("page size must be non-zero"),
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    pub log_filter: String,
    pub poll_interval_ms: u64,
    pub max_poll_secs: Option<u64>,
    pub result_retry_attempts: u32,
    pub result_retry_delay_ms: u64,
    pub page_retry_attempts: u32,
    pub page_retry_delay_ms: u64,
    pub page_size: NonZeroU32,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Unset or unparseable values
    /// fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let api_url = lookup("DASHBOARD_API_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.into());
        let api_token = lookup("DASHBOARD_API_TOKEN").filter(|v| !v.trim().is_empty());
        let log_filter = lookup("RUST_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.into());
        let poll_interval_ms = parsed("DASHBOARD_POLL_INTERVAL_MS")
            .filter(|v| *v > 0)
            .unwrap_or(3_000);
        let max_poll_secs = parsed("DASHBOARD_MAX_POLL_SECS").filter(|v| *v > 0);
        let result_retry_attempts = parsed("DASHBOARD_RESULT_RETRY_ATTEMPTS")
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(10);
        let result_retry_delay_ms = parsed("DASHBOARD_RESULT_RETRY_DELAY_MS").unwrap_or(3_000);
        let page_retry_attempts = parsed("DASHBOARD_PAGE_RETRY_ATTEMPTS")
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(3);
        let page_retry_delay_ms = parsed("DASHBOARD_PAGE_RETRY_DELAY_MS").unwrap_or(2_000);
        let page_size = parsed("DASHBOARD_PAGE_SIZE")
            .and_then(|v| u32::try_from(v).ok())
            .and_then(NonZeroU32::new)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Self {
            api_url,
            api_token,
            log_filter,
            poll_interval_ms,
            max_poll_secs,
            result_retry_attempts,
            result_retry_delay_ms,
            page_retry_attempts,
            page_retry_delay_ms,
            page_size,
        }
    }

    pub fn job_config(&self) -> JobConfig {
        JobConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            result_retry: RetryPolicy::new(
                self.result_retry_attempts,
                Duration::from_millis(self.result_retry_delay_ms),
            ),
            max_poll_duration: self.max_poll_secs.map(Duration::from_secs),
        }
    }

    pub fn page_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.page_retry_attempts,
            Duration::from_millis(self.page_retry_delay_ms),
        )
    }
}
