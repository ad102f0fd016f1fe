//! HR (workforce-management) source adapter.
//!
//! Pages through `/hr/v2/workers`, maps each worker onto a [`Driver`] and
//! applies the eligibility filter: a payroll file number must exist, the
//! primary assignment must be active and the sync opt-out marker must not be
//! set to "No".

use std::fmt;
use std::path::PathBuf;

use adsync_core::Driver;
use adsync_transport::{
    ClientCredentials, ClientIdentity, HttpTransport, TokenCache, TransportError,
};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::{AdapterError, AdapterOptions, DriverPopulation, DriverSource, EligibilityStats};

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const ACTIVE_STATUS_CODE: &str = "A";
/// Substring identifying the opt-out custom field once punctuation and case are removed.
pub const OPT_OUT_MARKER: &str = "OVERDRIVE";
pub const OPT_OUT_VALUE: &str = "No";

#[derive(Clone, Serialize, Deserialize)]
pub struct HrConfig {
    #[serde(alias = "clientid")]
    pub client_id: String,
    #[serde(alias = "clientsecret")]
    pub client_secret: String,
    #[serde(alias = "baseurl")]
    pub base_url: String,
    #[serde(alias = "certfile")]
    pub cert_file: PathBuf,
    #[serde(alias = "keyfile")]
    pub key_file: PathBuf,
}

impl fmt::Debug for HrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HrConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .finish()
    }
}

impl HrConfig {
    pub fn validate(&self) -> Result<(), AdapterError> {
        let required = [
            ("hr.client_id", self.client_id.trim().is_empty()),
            ("hr.client_secret", self.client_secret.trim().is_empty()),
            ("hr.base_url", self.base_url.trim().is_empty()),
            ("hr.cert_file", self.cert_file.as_os_str().is_empty()),
            ("hr.key_file", self.key_file.as_os_str().is_empty()),
        ];
        match required.iter().find(|(_, missing)| *missing) {
            Some((name, _)) => Err(TransportError::Configuration(format!(
                "required configuration missing {name}"
            ))
            .into()),
            None => Ok(()),
        }
    }
}

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkersPage {
    #[serde(deserialize_with = "nullable")]
    pub workers: Vec<Worker>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Worker {
    #[serde(rename = "workerID", alias = "workerId", deserialize_with = "nullable")]
    pub worker_id: WorkerId,
    #[serde(deserialize_with = "nullable")]
    pub person: Person,
    #[serde(deserialize_with = "nullable")]
    pub work_assignments: Vec<WorkAssignment>,
    #[serde(deserialize_with = "nullable")]
    pub custom_field_group: CustomFieldGroup,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerId {
    #[serde(deserialize_with = "nullable")]
    pub id_value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Person {
    #[serde(deserialize_with = "nullable")]
    pub legal_name: LegalName,
    #[serde(deserialize_with = "nullable")]
    pub legal_address: LegalAddress,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LegalName {
    #[serde(deserialize_with = "nullable")]
    pub given_name: String,
    #[serde(deserialize_with = "nullable")]
    pub family_name1: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LegalAddress {
    #[serde(deserialize_with = "nullable")]
    pub line_one: String,
    #[serde(deserialize_with = "nullable")]
    pub line_two: String,
    #[serde(deserialize_with = "nullable")]
    pub city_name: String,
    #[serde(deserialize_with = "nullable")]
    pub country_subdivision_level1: CodeValue,
    #[serde(deserialize_with = "nullable")]
    pub postal_code: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeValue {
    #[serde(deserialize_with = "nullable")]
    pub code_value: String,
    #[serde(deserialize_with = "nullable")]
    pub short_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkAssignment {
    #[serde(deserialize_with = "nullable")]
    pub payroll_file_number: String,
    /// Carried for diagnostics; the first assignment is always treated as primary.
    #[serde(deserialize_with = "nullable")]
    pub primary_indicator: bool,
    #[serde(deserialize_with = "nullable")]
    pub assignment_status: AssignmentStatus,
    #[serde(deserialize_with = "nullable")]
    pub custom_field_group: CustomFieldGroup,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssignmentStatus {
    #[serde(deserialize_with = "nullable")]
    pub status_code: CodeValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomFieldGroup {
    #[serde(deserialize_with = "nullable")]
    pub string_fields: Vec<StringField>,
    #[serde(deserialize_with = "nullable")]
    pub code_fields: Vec<CodeField>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StringField {
    #[serde(deserialize_with = "nullable")]
    pub name_code: CodeValue,
    #[serde(deserialize_with = "nullable")]
    pub string_value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeField {
    #[serde(deserialize_with = "nullable")]
    pub name_code: CodeValue,
    #[serde(deserialize_with = "nullable")]
    pub code_value: String,
}

/// Wire-independent view of one custom field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomField {
    pub name_code: String,
    pub short_name: String,
    pub value: String,
}

impl CustomFieldGroup {
    /// String fields first, then code fields, each in wire order.
    pub fn fields(&self) -> Vec<CustomField> {
        let strings = self.string_fields.iter().map(|f| CustomField {
            name_code: f.name_code.code_value.clone(),
            short_name: f.name_code.short_name.clone(),
            value: f.string_value.clone(),
        });
        let codes = self.code_fields.iter().map(|f| CustomField {
            name_code: f.name_code.code_value.clone(),
            short_name: f.name_code.short_name.clone(),
            value: f.code_value.clone(),
        });
        strings.chain(codes).collect()
    }
}

fn normalize_marker(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

/// True when either name slot of the field names the sync opt-out marker.
pub fn is_opt_out_field(field: &CustomField) -> bool {
    [&field.name_code, &field.short_name]
        .iter()
        .any(|name| normalize_marker(name).contains(OPT_OUT_MARKER))
}

/// Value of the first opt-out field, searching the worker scope before each
/// assignment scope in order. A blank value still counts as found.
pub fn opt_out_value<'a>(
    worker_fields: &'a [CustomField],
    assignment_fields: &'a [Vec<CustomField>],
) -> Option<&'a str> {
    std::iter::once(worker_fields)
        .chain(assignment_fields.iter().map(Vec::as_slice))
        .find_map(|scope| scope.iter().find(|field| is_opt_out_field(field)))
        .map(|field| field.value.trim())
}

pub fn is_opted_out(worker_fields: &[CustomField], assignment_fields: &[Vec<CustomField>]) -> bool {
    opt_out_value(worker_fields, assignment_fields)
        .is_some_and(|value| value.eq_ignore_ascii_case(OPT_OUT_VALUE))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerDisposition {
    Eligible(Driver),
    MissingEmployeeNumber,
    Inactive,
    OptedOut,
}

pub fn classify_worker(worker: &Worker) -> WorkerDisposition {
    let Some(primary) = worker.work_assignments.first() else {
        return WorkerDisposition::MissingEmployeeNumber;
    };
    let employee_number = primary.payroll_file_number.trim();
    if employee_number.is_empty() {
        return WorkerDisposition::MissingEmployeeNumber;
    }

    if !primary
        .assignment_status
        .status_code
        .code_value
        .trim()
        .eq_ignore_ascii_case(ACTIVE_STATUS_CODE)
    {
        return WorkerDisposition::Inactive;
    }

    let worker_fields = worker.custom_field_group.fields();
    let assignment_fields = worker
        .work_assignments
        .iter()
        .map(|wa| wa.custom_field_group.fields())
        .collect::<Vec<_>>();
    if is_opted_out(&worker_fields, &assignment_fields) {
        return WorkerDisposition::OptedOut;
    }

    let name = &worker.person.legal_name;
    let address = &worker.person.legal_address;
    WorkerDisposition::Eligible(Driver {
        employee_number: employee_number.to_string(),
        first_name: name.given_name.clone(),
        last_name: name.family_name1.clone(),
        address1: address.line_one.clone(),
        address2: address.line_two.clone(),
        city: address.city_name.clone(),
        state: address.country_subdivision_level1.code_value.clone(),
        zip_code: address.postal_code.clone(),
    })
}

/// Splits workers into eligible drivers and exclusion counts, keeping order.
pub fn eligible_population(workers: &[Worker]) -> DriverPopulation {
    let mut population = DriverPopulation {
        drivers: Vec::new(),
        stats: EligibilityStats {
            total_workers: workers.len(),
            ..EligibilityStats::default()
        },
    };
    for worker in workers {
        match classify_worker(worker) {
            WorkerDisposition::Eligible(driver) => population.drivers.push(driver),
            WorkerDisposition::MissingEmployeeNumber => {
                debug!(worker_id = %worker.worker_id.id_value, "worker has no payroll file number");
                population.stats.missing_employee_number += 1;
            }
            WorkerDisposition::Inactive => population.stats.inactive += 1,
            WorkerDisposition::OptedOut => population.stats.opted_out += 1,
        }
    }
    population.stats.eligible = population.drivers.len();
    population
}

#[derive(Debug)]
pub struct HrSource {
    base_url: String,
    http: HttpTransport,
    tokens: TokenCache,
    page_size: usize,
}

impl HrSource {
    /// Builds the mutual-TLS client from configuration. Certificate problems
    /// surface here, before any request is made.
    pub fn from_config(config: &HrConfig, options: &AdapterOptions) -> Result<Self, AdapterError> {
        config.validate()?;
        let mut http_config = options.http_client_config();
        http_config.identity = Some(ClientIdentity::new(&config.cert_file, &config.key_file));
        let http = HttpTransport::new("hr", &http_config)?;
        Self::new(&config.base_url, &config.client_id, &config.client_secret, http, options)
    }

    pub fn new(
        base_url: &str,
        client_id: &str,
        client_secret: &str,
        http: HttpTransport,
        options: &AdapterOptions,
    ) -> Result<Self, AdapterError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(TransportError::Configuration("hr base url is required".into()).into());
        }
        if options.page_size == 0 {
            return Err(TransportError::Configuration("hr page size must be positive".into()).into());
        }
        let tokens = TokenCache::new(
            ClientCredentials {
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
                token_url: format!("{base_url}/auth/oauth/v2/token"),
            },
            http.clone(),
            options.refresh_margin,
        )?;
        Ok(Self {
            base_url,
            http,
            tokens,
            page_size: options.page_size,
        })
    }

    /// Reads every page of workers. Any failing page fails the whole fetch.
    pub async fn fetch_workers(&self) -> Result<Vec<Worker>, AdapterError> {
        let url = format!("{}/hr/v2/workers", self.base_url);
        let mut workers = Vec::new();
        let mut skip = 0usize;

        loop {
            let token = self.tokens.valid_token().await?;
            let resp = self
                .http
                .send_idempotent(|| {
                    self.http
                        .client()
                        .get(&url)
                        .query(&[("$top", self.page_size), ("$skip", skip)])
                        .bearer_auth(&token.access_token)
                        .header(ACCEPT, "application/json")
                })
                .await?
                .error_for_status()?;

            let page: WorkersPage = if resp.status == StatusCode::NO_CONTENT || resp.body.is_empty() {
                WorkersPage::default()
            } else {
                resp.json()?
            };

            let fetched = page.workers.len();
            if fetched == 0 {
                break;
            }
            workers.extend(page.workers);
            info!(fetched, total = workers.len(), skip, "fetched HR workers page");

            if fetched < self.page_size {
                break;
            }
            skip += self.page_size;
        }

        Ok(workers)
    }
}

#[async_trait]
impl DriverSource for HrSource {
    fn source_id(&self) -> &'static str {
        "hr"
    }

    async fn fetch_eligible_drivers(&self) -> Result<DriverPopulation, AdapterError> {
        let workers = self.fetch_workers().await?;
        let population = eligible_population(&workers);
        info!(stats = %population.stats, "HR filter results");
        Ok(population)
    }
}
