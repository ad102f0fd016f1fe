//! Core domain model for driver address reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adsync-core";

/// Number of leading postal-code characters that take part in comparisons.
pub const POSTAL_PREFIX_LEN: usize = 5;

/// Eligible HR worker, normalized into the fields the fleet side cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    /// Business key exactly as the HR system stores it (leading zeros kept).
    pub employee_number: String,
    pub first_name: String,
    pub last_name: String,
    pub address1: String,
    pub address2: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
}

impl Driver {
    /// Business key in the form the fleet system expects.
    pub fn fleet_key(&self) -> String {
        normalize_employee_number(&self.employee_number)
    }
}

/// Fleet-side driver record returned by a lookup or an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetDriverRecord {
    pub driver_id: String,
    pub address1: String,
    pub address2: String,
    pub postal_code: String,
}

/// Strips surrounding whitespace and leading zeros from an employee number.
///
/// The HR system zero-pads payroll file numbers and the fleet system does not.
/// A key made only of zeros collapses to `"0"` rather than an empty string.
pub fn normalize_employee_number(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed.trim_start_matches('0');
    if stripped.is_empty() && !trimmed.is_empty() {
        "0".to_string()
    } else {
        stripped.to_string()
    }
}

pub fn postal_prefix(postal_code: &str) -> String {
    postal_code.trim().chars().take(POSTAL_PREFIX_LEN).collect()
}

fn address_line_eq(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Returns true when the fleet record is stale relative to the HR driver.
///
/// Address lines compare trimmed and case-insensitively; postal codes compare
/// on their five-character prefix so ZIP+4 and truncated ZIPs are equivalent.
pub fn needs_update(driver: &Driver, record: &FleetDriverRecord) -> bool {
    !(address_line_eq(&driver.address1, &record.address1)
        && address_line_eq(&driver.address2, &record.address2)
        && postal_prefix(&driver.zip_code) == postal_prefix(&record.postal_code))
}

/// Result of reconciling one driver (not found) or one fleet record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOutcome {
    Updated,
    Unchanged,
    NotFound,
    Skipped,
    Failed,
}

/// Per-run outcome counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_source_drivers: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub not_found_in_sink: usize,
    pub skipped: usize,
    pub errors: usize,
    /// Set when a run deadline stopped the loop before every driver was seen.
    pub interrupted: bool,
}

impl RunReport {
    pub fn start(total_source_drivers: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            total_source_drivers,
            updated: 0,
            unchanged: 0,
            not_found_in_sink: 0,
            skipped: 0,
            errors: 0,
            interrupted: false,
        }
    }

    /// Folds one outcome into the report.
    #[must_use]
    pub fn apply(mut self, outcome: RecordOutcome) -> Self {
        match outcome {
            RecordOutcome::Updated => self.updated += 1,
            RecordOutcome::Unchanged => self.unchanged += 1,
            RecordOutcome::NotFound => self.not_found_in_sink += 1,
            RecordOutcome::Skipped => self.skipped += 1,
            RecordOutcome::Failed => self.errors += 1,
        }
        self
    }

    #[must_use]
    pub fn apply_all(self, outcomes: impl IntoIterator<Item = RecordOutcome>) -> Self {
        outcomes.into_iter().fold(self, Self::apply)
    }

    #[must_use]
    pub fn finish(mut self, interrupted: bool) -> Self {
        self.finished_at = Some(Utc::now());
        self.interrupted = interrupted;
        self
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![
            "=== SYNC COMPLETE ===".to_string(),
            format!("  Run ID:              {}", self.run_id),
            format!("  Total HR drivers:    {}", self.total_source_drivers),
            format!("  Updated:             {}", self.updated),
            format!("  Unchanged:           {}", self.unchanged),
            format!("  Not found in fleet:  {}", self.not_found_in_sink),
            format!("  Skipped (multi-veh): {}", self.skipped),
            format!("  Errors:              {}", self.errors),
        ];
        if self.interrupted {
            lines.push("  Run deadline reached before all drivers were processed".to_string());
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(address1: &str, address2: &str, zip: &str) -> Driver {
        Driver {
            employee_number: "0045".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            address1: address1.into(),
            address2: address2.into(),
            city: "Cincinnati".into(),
            state: "OH".into(),
            zip_code: zip.into(),
        }
    }

    fn record(address1: &str, address2: &str, post_code: &str) -> FleetDriverRecord {
        FleetDriverRecord {
            driver_id: "17".into(),
            address1: address1.into(),
            address2: address2.into(),
            postal_code: post_code.into(),
        }
    }

    #[test]
    fn leading_zeros_are_stripped_from_business_keys() {
        assert_eq!(normalize_employee_number("00321"), "321");
        assert_eq!(normalize_employee_number(" 0045 "), "45");
        assert_eq!(normalize_employee_number("4500"), "4500");
        assert_eq!(normalize_employee_number("000"), "0");
        assert_eq!(normalize_employee_number(""), "");
        assert_eq!(driver("", "", "").fleet_key(), "45");
    }

    #[test]
    fn zip_plus_four_matches_truncated_postcode() {
        let d = driver("1 Main St", "", "45202-1234");
        assert!(!needs_update(&d, &record("1 Main St", "", "45202")));
    }

    #[test]
    fn comparison_ignores_case_and_surrounding_whitespace() {
        let d = driver("1 Main St", "Apt 2", "45202");
        assert!(!needs_update(&d, &record("  1 MAIN st ", "apt 2", "45202")));
    }

    #[test]
    fn any_differing_field_requires_update() {
        let d = driver("1 Main St", "", "45202-1234");
        assert!(needs_update(&d, &record("1 Main Street", "", "45202")));
        assert!(needs_update(&d, &record("1 Main St", "Suite 5", "45202")));
        assert!(needs_update(&d, &record("1 Main St", "", "45203")));
    }

    #[test]
    fn reducer_counts_each_outcome_bucket() {
        let report = RunReport::start(3).apply_all([
            RecordOutcome::Updated,
            RecordOutcome::Updated,
            RecordOutcome::Unchanged,
            RecordOutcome::NotFound,
            RecordOutcome::Skipped,
            RecordOutcome::Failed,
        ]);
        assert_eq!(report.total_source_drivers, 3);
        assert_eq!(report.updated, 2);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.not_found_in_sink, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors, 1);

        let finished = report.finish(true);
        assert!(finished.finished_at.is_some());
        assert!(finished.interrupted);
        assert!(finished.summary_lines().last().unwrap().contains("deadline"));
    }
}
