use std::time::Duration;

use adsync_adapters::{AdapterError, AddressUpdate, DriverSource, FleetSink};
use adsync_core::{needs_update, Driver, FleetDriverRecord, RecordOutcome, RunReport};
use anyhow::{anyhow, Context, Result};
use futures_util::{future, stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Drivers reconciled at the same time. Records of one driver stay sequential.
    pub concurrency: usize,
    pub run_deadline: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            run_deadline: None,
        }
    }
}

/// Maps the result of one fleet update onto a record outcome.
pub fn outcome_for_update(result: &Result<FleetDriverRecord, AdapterError>) -> RecordOutcome {
    match result {
        Ok(_) => RecordOutcome::Updated,
        Err(err) if err.is_business_rejection() => RecordOutcome::Skipped,
        Err(_) => RecordOutcome::Failed,
    }
}

/// Outcomes of one driver. `cut_short` is set when the run deadline stopped
/// updates of some of its records.
struct DriverOutcome {
    outcomes: Vec<RecordOutcome>,
    cut_short: bool,
}

pub struct ReconciliationEngine<S, F> {
    source: S,
    sink: F,
    options: EngineOptions,
}

impl<S: DriverSource, F: FleetSink> ReconciliationEngine<S, F> {
    pub fn new(source: S, sink: F) -> Self {
        Self {
            source,
            sink,
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs one reconciliation pass.
    ///
    /// Only a failure to obtain the HR population is fatal. Per-driver and
    /// per-record failures are counted in the report. When the run deadline
    /// passes, drivers not yet started are left alone, no further updates are
    /// sent and the report is marked interrupted.
    pub async fn run(&self) -> Result<RunReport> {
        let deadline = self.options.run_deadline.map(|limit| Instant::now() + limit);

        let fetch = self.source.fetch_eligible_drivers();
        let population = match deadline {
            Some(at) => tokio::time::timeout_at(at, fetch).await.map_err(|_| {
                anyhow!("run deadline reached while fetching drivers from {}", self.source.source_id())
            })?,
            None => fetch.await,
        }
        .with_context(|| format!("fetching eligible drivers from {}", self.source.source_id()))?;

        info!(
            source = self.source.source_id(),
            sink = self.sink.sink_id(),
            drivers = population.drivers.len(),
            "starting fleet reconciliation"
        );

        let total = population.drivers.len();
        let mut report = RunReport::start(total);
        let mut processed = 0usize;
        let mut cut_short = false;

        let mut outcomes = stream::iter(population.drivers.iter())
            .take_while(|_| future::ready(deadline.map_or(true, |at| Instant::now() < at)))
            .map(|driver| self.reconcile_driver_until(driver, deadline))
            .buffer_unordered(self.options.concurrency.max(1));
        while let Some(driver_outcome) = outcomes.next().await {
            processed += 1;
            cut_short |= driver_outcome.cut_short;
            report = report.apply_all(driver_outcome.outcomes);
        }

        let interrupted = cut_short || processed < total;
        if interrupted {
            warn!(processed, total, "run deadline reached; remaining drivers not processed");
        }
        Ok(report.finish(interrupted))
    }

    /// Looks the driver up in the fleet and reconciles every matching record.
    pub async fn reconcile_driver(&self, driver: &Driver) -> Vec<RecordOutcome> {
        self.reconcile_driver_until(driver, None).await.outcomes
    }

    async fn reconcile_driver_until(&self, driver: &Driver, deadline: Option<Instant>) -> DriverOutcome {
        let key = driver.fleet_key();
        let records = match self.sink.find_drivers(&key).await {
            Ok(records) => records,
            Err(err) => {
                error!(employee_number = %key, kind = ?err.kind(), error = %err, "fleet lookup failed");
                return DriverOutcome {
                    outcomes: vec![RecordOutcome::Failed],
                    cut_short: false,
                };
            }
        };
        if records.is_empty() {
            debug!(employee_number = %key, "driver not found in fleet");
            return DriverOutcome {
                outcomes: vec![RecordOutcome::NotFound],
                cut_short: false,
            };
        }

        let mut outcome = DriverOutcome {
            outcomes: Vec::with_capacity(records.len()),
            cut_short: false,
        };
        for record in &records {
            if !needs_update(driver, record) {
                outcome.outcomes.push(RecordOutcome::Unchanged);
                continue;
            }
            if deadline.is_some_and(|at| Instant::now() >= at) {
                warn!(employee_number = %key, driver_id = %record.driver_id, "run deadline reached; update not sent");
                outcome.cut_short = true;
                continue;
            }
            outcome.outcomes.push(self.update_record(driver, &key, record).await);
        }
        outcome
    }

    async fn update_record(&self, driver: &Driver, key: &str, record: &FleetDriverRecord) -> RecordOutcome {
        info!(
            employee_number = key,
            driver_id = %record.driver_id,
            "updating address: '{} {} {}' -> '{} {} {}'",
            record.address1,
            record.address2,
            record.postal_code,
            driver.address1,
            driver.address2,
            driver.zip_code
        );
        let result = self
            .sink
            .update_driver_address(&record.driver_id, &AddressUpdate::from(driver))
            .await;
        let outcome = outcome_for_update(&result);
        match &result {
            Ok(_) => info!(employee_number = key, driver_id = %record.driver_id, "address updated"),
            Err(err) if outcome == RecordOutcome::Skipped => {
                warn!(employee_number = key, driver_id = %record.driver_id, error = %err, "update rejected; skipping")
            }
            Err(err) => error!(
                employee_number = key,
                driver_id = %record.driver_id,
                kind = ?err.kind(),
                error = %err,
                "address update failed"
            ),
        }
        outcome
    }
}
