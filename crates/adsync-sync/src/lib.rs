//! Run configuration and the one-shot reconciliation entry point.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use adsync_adapters::{AdapterOptions, FleetClient, FleetConfig, HrConfig, HrSource};
use adsync_core::RunReport;
use adsync_transport::{BackoffPolicy, DEFAULT_REFRESH_MARGIN_SECS};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

mod engine;

pub use engine::{outcome_for_update, EngineOptions, ReconciliationEngine};

pub const CRATE_NAME: &str = "adsync-sync";

/// Largest accepted token refresh margin (one day).
pub const MAX_REFRESH_MARGIN_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(alias = "adp")]
    pub hr: HrConfig,
    #[serde(alias = "mikealbert")]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub http_timeout_secs: u64,
    pub token_refresh_margin_secs: i64,
    pub page_size: usize,
    pub concurrency: usize,
    pub run_deadline_secs: Option<u64>,
    pub max_retries: usize,
    pub user_agent: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 30,
            token_refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
            page_size: adsync_adapters::hr::DEFAULT_PAGE_SIZE,
            concurrency: 1,
            run_deadline_secs: None,
            max_retries: BackoffPolicy::default().max_retries,
            user_agent: format!("adsync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("parsing configuration yaml")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.hr.validate()?;
        self.fleet.validate()?;
        if self.runtime.page_size == 0 {
            bail!("runtime.page_size must be greater than zero");
        }
        if self.runtime.concurrency == 0 {
            bail!("runtime.concurrency must be greater than zero");
        }
        if !(0..=MAX_REFRESH_MARGIN_SECS).contains(&self.runtime.token_refresh_margin_secs) {
            bail!("runtime.token_refresh_margin_secs must be between 0 and {MAX_REFRESH_MARGIN_SECS}");
        }
        Ok(())
    }

    /// Validates and writes the configuration as YAML, owner-readable only on unix.
    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<()> {
        use std::io::Write;

        let path = path.as_ref();
        self.validate()?;
        let yaml = serde_yaml::to_string(self).context("serializing configuration")?;

        let mut options = std::fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(yaml.as_bytes())
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn adapter_options(&self) -> AdapterOptions {
        AdapterOptions {
            timeout: Duration::from_secs(self.runtime.http_timeout_secs),
            user_agent: Some(self.runtime.user_agent.clone()),
            refresh_margin: chrono::Duration::try_seconds(self.runtime.token_refresh_margin_secs)
                .unwrap_or_else(|| chrono::Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS)),
            page_size: self.runtime.page_size,
            backoff: BackoffPolicy {
                max_retries: self.runtime.max_retries,
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            concurrency: self.runtime.concurrency,
            run_deadline: self.runtime.run_deadline_secs.map(Duration::from_secs),
        }
    }
}

/// Multi-line human readable summary of a finished run.
pub struct RunSummary<'a>(pub &'a RunReport);

impl fmt::Display for RunSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.summary_lines().join("\n"))
    }
}

pub fn log_summary(report: &RunReport) {
    for line in report.summary_lines() {
        info!("{line}");
    }
}

/// Loads the configuration, builds both adapters and runs one reconciliation.
pub async fn run_sync_from_config_file(path: impl AsRef<Path>) -> Result<RunReport> {
    let config = SyncConfig::from_file(path)?;
    run_sync(&config).await
}

pub async fn run_sync(config: &SyncConfig) -> Result<RunReport> {
    let options = config.adapter_options();
    let hr = HrSource::from_config(&config.hr, &options).context("creating HR client")?;
    let fleet = FleetClient::from_config(&config.fleet, &options).context("creating fleet client")?;

    let engine = ReconciliationEngine::new(hr, fleet).with_options(config.engine_options());
    let report = engine.run().await?;
    log_summary(&report);
    Ok(report)
}
