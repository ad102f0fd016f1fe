//! Fleet-management sink adapter: driver lookup by employee number and
//! address updates.

use std::fmt;

use adsync_core::FleetDriverRecord;
use adsync_transport::{ClientCredentials, HttpTransport, TokenCache, TransportError};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{AdapterError, AdapterOptions, AddressUpdate, FleetSink};

/// Structured error code the fleet API may attach to a multi-vehicle rejection.
pub const MULTIPLE_VEHICLES_CODE: &str = "MULTIPLE_VEHICLES_ALLOCATED";
const MULTIPLE_VEHICLES_TEXT: &str = "multiple vehicles allocated";

#[derive(Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(alias = "clientid")]
    pub client_id: String,
    #[serde(alias = "clientsecret")]
    pub client_secret: String,
    pub endpoint: String,
}

impl fmt::Debug for FleetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl FleetConfig {
    pub fn validate(&self) -> Result<(), AdapterError> {
        let required = [
            ("fleet.client_id", &self.client_id),
            ("fleet.client_secret", &self.client_secret),
            ("fleet.endpoint", &self.endpoint),
        ];
        match required.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((name, _)) => Err(TransportError::Configuration(format!(
                "required configuration missing {name}"
            ))
            .into()),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DriverIdValue {
    Number(i64),
    Text(String),
}

impl fmt::Display for DriverIdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
struct WireAddress {
    address1: Option<String>,
    address2: Option<String>,
    post_code: Option<String>,
}

/// Driver record as returned by the fleet API. `driverId` is mandatory so
/// that an unrelated JSON object never passes for a driver.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDriver {
    driver_id: DriverIdValue,
    #[serde(default)]
    address: Option<WireAddress>,
}

impl WireDriver {
    fn into_record(self) -> FleetDriverRecord {
        let address = self.address.unwrap_or_default();
        FleetDriverRecord {
            driver_id: self.driver_id.to_string(),
            address1: address.address1.unwrap_or_default(),
            address2: address.address2.unwrap_or_default(),
            postal_code: address.post_code.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FindResponse {
    List(Vec<WireDriver>),
    Wrapped { drivers: Vec<WireDriver> },
    Single(WireDriver),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FindRequest<'a> {
    employee_number: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateRequest {
    address: WireAddress,
}

fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Decides whether a failed update body is the multiple-vehicle business rule.
///
/// A structured `code`/`errorCode` field is consulted first; otherwise the
/// message text is searched.
pub fn is_multiple_vehicle_rejection(body: &str) -> bool {
    if let Ok(value) = serde_json::from_str::<JsonValue>(body) {
        let code = ["code", "errorCode"]
            .iter()
            .find_map(|key| value.get(*key).and_then(JsonValue::as_str));
        if code.is_some_and(|c| normalize_code(c) == normalize_code(MULTIPLE_VEHICLES_CODE)) {
            return true;
        }
    }
    body.to_lowercase().contains(MULTIPLE_VEHICLES_TEXT)
}

#[derive(Debug)]
pub struct FleetClient {
    endpoint: String,
    http: HttpTransport,
    tokens: TokenCache,
}

impl FleetClient {
    pub fn from_config(config: &FleetConfig, options: &AdapterOptions) -> Result<Self, AdapterError> {
        config.validate()?;
        let http = HttpTransport::new("fleet", &options.http_client_config())?;
        Self::new(&config.endpoint, &config.client_id, &config.client_secret, http, options)
    }

    pub fn new(
        endpoint: &str,
        client_id: &str,
        client_secret: &str,
        http: HttpTransport,
        options: &AdapterOptions,
    ) -> Result<Self, AdapterError> {
        let endpoint = endpoint.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(TransportError::Configuration("fleet endpoint is required".into()).into());
        }
        let tokens = TokenCache::new(
            ClientCredentials {
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
                token_url: format!("{endpoint}/token"),
            },
            http.clone(),
            options.refresh_margin,
        )?;
        Ok(Self {
            endpoint,
            http,
            tokens,
        })
    }
}

#[async_trait]
impl FleetSink for FleetClient {
    fn sink_id(&self) -> &'static str {
        "fleet"
    }

    async fn find_drivers(&self, employee_number: &str) -> Result<Vec<FleetDriverRecord>, AdapterError> {
        let token = self.tokens.valid_token().await?;
        let request = self
            .http
            .client()
            .post(format!("{}/driver-management/driver/find", self.endpoint))
            .bearer_auth(&token.access_token)
            .header(ACCEPT, "application/json")
            .json(&FindRequest { employee_number });

        let resp = self.http.send(request).await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let resp = resp.error_for_status()?;
        if resp.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let drivers = match resp.json::<FindResponse>()? {
            FindResponse::List(drivers) | FindResponse::Wrapped { drivers } => drivers,
            FindResponse::Single(driver) => vec![driver],
        };
        let records = drivers
            .into_iter()
            .map(WireDriver::into_record)
            .collect::<Vec<_>>();
        debug!(employee_number, matches = records.len(), "fleet lookup complete");
        Ok(records)
    }

    async fn update_driver_address(
        &self,
        driver_id: &str,
        update: &AddressUpdate,
    ) -> Result<FleetDriverRecord, AdapterError> {
        let token = self.tokens.valid_token().await?;
        let body = UpdateRequest {
            address: WireAddress {
                address1: Some(update.address1.clone()),
                address2: Some(update.address2.clone()),
                post_code: Some(update.zip_code.clone()),
            },
        };
        let request = self
            .http
            .client()
            .post(format!("{}/driver-management/driver/{driver_id}", self.endpoint))
            .bearer_auth(&token.access_token)
            .header(ACCEPT, "application/json")
            .json(&body);

        let resp = self.http.send(request).await?;
        if !resp.status.is_success() {
            let text = resp.body_text();
            if is_multiple_vehicle_rejection(&text) {
                return Err(AdapterError::BusinessRejection {
                    driver_id: driver_id.to_string(),
                    message: text,
                });
            }
            return Err(TransportError::Status {
                status: resp.status.as_u16(),
                url: resp.url,
                body: text,
            }
            .into());
        }

        let echoed = FleetDriverRecord {
            driver_id: driver_id.to_string(),
            address1: update.address1.clone(),
            address2: update.address2.clone(),
            postal_code: update.zip_code.clone(),
        };
        if resp.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(echoed);
        }
        match resp.json::<WireDriver>() {
            Ok(wire) => Ok(wire.into_record()),
            Err(err) => {
                debug!(driver_id, error = %err, "update accepted with unrecognised body; using requested values");
                Ok(echoed)
            }
        }
    }
}
