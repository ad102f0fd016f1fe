//! Upstream adapter contracts plus the HR source and fleet sink implementations.

use std::fmt;
use std::time::Duration;

use adsync_core::{Driver, FleetDriverRecord};
use adsync_transport::{BackoffPolicy, HttpClientConfig, TransportError, DEFAULT_REFRESH_MARGIN_SECS};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod fleet;
pub mod hr;

pub use fleet::{is_multiple_vehicle_rejection, FleetClient, FleetConfig};
pub use hr::{
    classify_worker, is_opt_out_field, is_opted_out, opt_out_value, CustomField, HrConfig,
    HrSource, Worker, WorkerDisposition,
};

pub const CRATE_NAME: &str = "adsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("fleet driver {driver_id} rejected the update: {message}")]
    BusinessRejection { driver_id: String, message: String },
}

/// Coarse error taxonomy used for logging and outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration,
    Authentication,
    Transport,
    Protocol,
    BusinessRejection,
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(TransportError::Configuration(_)) => ErrorKind::Configuration,
            Self::Transport(TransportError::Authentication(_)) => ErrorKind::Authentication,
            Self::Transport(TransportError::Request(_)) => ErrorKind::Transport,
            Self::Transport(TransportError::Status { .. } | TransportError::Decode { .. }) => {
                ErrorKind::Protocol
            }
            Self::BusinessRejection { .. } => ErrorKind::BusinessRejection,
        }
    }

    pub fn is_business_rejection(&self) -> bool {
        self.kind() == ErrorKind::BusinessRejection
    }
}

/// Runtime knobs shared by both adapters.
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub refresh_margin: chrono::Duration,
    pub page_size: usize,
    pub backoff: BackoffPolicy,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            refresh_margin: chrono::Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            page_size: hr::DEFAULT_PAGE_SIZE,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl AdapterOptions {
    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.timeout,
            user_agent: self.user_agent.clone(),
            identity: None,
            backoff: self.backoff,
        }
    }
}

/// Why workers were left out of the eligible driver population.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityStats {
    pub total_workers: usize,
    pub missing_employee_number: usize,
    pub inactive: usize,
    pub opted_out: usize,
    pub eligible: usize,
}

impl fmt::Display for EligibilityStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total workers, {} skipped (no employee number), {} skipped (inactive/terminated), {} skipped (sync opt-out), {} eligible for sync",
            self.total_workers, self.missing_employee_number, self.inactive, self.opted_out, self.eligible
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverPopulation {
    pub drivers: Vec<Driver>,
    pub stats: EligibilityStats,
}

/// New address values pushed to a fleet driver record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressUpdate {
    pub address1: String,
    pub address2: String,
    pub zip_code: String,
}

impl From<&Driver> for AddressUpdate {
    fn from(driver: &Driver) -> Self {
        Self {
            address1: driver.address1.clone(),
            address2: driver.address2.clone(),
            zip_code: driver.zip_code.clone(),
        }
    }
}

/// Authoritative side of the sync.
#[async_trait]
pub trait DriverSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Fetches every worker and returns the eligible drivers in source order.
    async fn fetch_eligible_drivers(&self) -> Result<DriverPopulation, AdapterError>;
}

/// Destination side of the sync.
#[async_trait]
pub trait FleetSink: Send + Sync {
    fn sink_id(&self) -> &'static str;

    /// Looks up fleet records by normalized business key. No match is `Ok(vec![])`.
    async fn find_drivers(&self, employee_number: &str) -> Result<Vec<FleetDriverRecord>, AdapterError>;

    async fn update_driver_address(
        &self,
        driver_id: &str,
        update: &AddressUpdate,
    ) -> Result<FleetDriverRecord, AdapterError>;
}
