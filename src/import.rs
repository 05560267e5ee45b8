//! Calendar-import reconciliation.
//!
//! An external calendar description (an owning user, their patients, and
//! their scheduled interventions) is reconciled against existing rows by a
//! single server-side procedure, `import_user_with_calendar`. The client
//! deliberately performs no per-entity writes: the procedure's transaction
//! is the only multi-entity write in the system with all-or-nothing
//! semantics, because a partial import (patients created but links
//! missing) would silently corrupt visibility under row-level security.
//!
//! The payload is validated before any network call; a structurally
//! invalid payload never reaches the store.

use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::error::Error;
use crate::models::{InterventionStatus, Role};
use crate::Domicare;

/// Patient description inside an import payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientImport {
    pub full_name: String,
    pub address: String,
    pub birth_date: NaiveDate,
    #[serde(default)]
    pub medical_notes: Option<String>,
}

/// Intervention description inside an import payload.
///
/// Patient and intervenant linkage is resolved server-side; the caller
/// only describes the schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionImport {
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<InterventionStatus>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Calendar description handed to the reconciler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportPayload {
    pub email: String,
    pub full_name: String,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub sub_role: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub patients: Vec<PatientImport>,
    #[serde(default)]
    pub interventions: Vec<InterventionImport>,
}

/// One payload violation; validation collects all of them rather than
/// stopping at the first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Proof that a payload passed validation; the only way into the RPC call
#[derive(Debug, Clone)]
pub struct ValidImport(ImportPayload);

impl ValidImport {
    pub fn payload(&self) -> &ImportPayload {
        &self.0
    }

    fn to_rpc_params(&self) -> Value {
        let payload = &self.0;
        json!({
            "p_email": payload.email,
            "p_full_name": payload.full_name,
            "p_role": payload.role,
            "p_sub_role": payload.sub_role,
            "p_phone_number": payload.phone_number,
            "p_patients_data": payload.patients,
            "p_interventions_data": payload.interventions,
        })
    }
}

impl ImportPayload {
    /// Check the payload shape before it goes anywhere near the network.
    pub fn validate(self) -> Result<ValidImport, Vec<ValidationError>> {
        let mut errors = Vec::new();

        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            errors.push(ValidationError {
                field: "email".to_string(),
                message: "must be a non-empty email address".to_string(),
            });
        }

        if self.full_name.trim().is_empty() {
            errors.push(ValidationError {
                field: "full_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        for (i, patient) in self.patients.iter().enumerate() {
            if patient.full_name.trim().is_empty() {
                errors.push(ValidationError {
                    field: format!("patients[{}].full_name", i),
                    message: "must not be empty".to_string(),
                });
            }
            if patient.address.trim().is_empty() {
                errors.push(ValidationError {
                    field: format!("patients[{}].address", i),
                    message: "must not be empty".to_string(),
                });
            }
        }

        for (i, intervention) in self.interventions.iter().enumerate() {
            if intervention.scheduled_start >= intervention.scheduled_end {
                errors.push(ValidationError {
                    field: format!("interventions[{}].scheduled_end", i),
                    message: "must be after scheduled_start".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(ValidImport(self))
        } else {
            Err(errors)
        }
    }
}

/// Procedure-defined import summary, surfaced to the caller verbatim.
/// Unknown server fields are preserved in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSummary {
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub patients_created: u32,
    #[serde(default)]
    pub interventions_created: u32,
    #[serde(default)]
    pub links_created: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Client side of the calendar-import reconciliation flow
pub struct ImportService<'a> {
    client: &'a Domicare,
}

impl<'a> ImportService<'a> {
    pub(crate) fn new(client: &'a Domicare) -> Self {
        Self { client }
    }

    /// Validate the payload, then reconcile it through the server-side
    /// procedure.
    pub async fn import(&self, payload: ImportPayload) -> Result<ImportSummary, Error> {
        let valid = payload.validate().map_err(Error::Validation)?;
        self.import_validated(valid).await
    }

    /// Reconcile an already-validated payload. One RPC call: the user, all
    /// patients, all interventions, and all links are created together or
    /// not at all. Store errors are re-thrown without translation.
    pub async fn import_validated(&self, payload: ValidImport) -> Result<ImportSummary, Error> {
        let session = self.client.stabilize_session().await?;

        info!(
            "importing calendar for {} ({} patients, {} interventions)",
            payload.payload().email,
            payload.payload().patients.len(),
            payload.payload().interventions.len()
        );

        let summary: ImportSummary = self
            .client
            .rpc("import_user_with_calendar", payload.to_rpc_params())
            .with_auth(&session.access_token)
            .map_err(Error::Store)?
            .call_rpc()
            .await?;

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_payload() -> ImportPayload {
        ImportPayload {
            email: "a@b.com".to_string(),
            full_name: "A B".to_string(),
            role: Some(Role::Aidant),
            sub_role: None,
            phone_number: None,
            patients: vec![PatientImport {
                full_name: "P1".to_string(),
                address: "X".to_string(),
                birth_date: NaiveDate::from_ymd_opt(1950, 1, 1).unwrap(),
                medical_notes: None,
            }],
            interventions: vec![InterventionImport {
                scheduled_start: Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap(),
                scheduled_end: Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap(),
                status: None,
                notes: vec!["toilette".to_string()],
            }],
        }
    }

    #[test]
    fn test_valid_payload_passes() {
        assert!(base_payload().validate().is_ok());
    }

    #[test]
    fn test_all_violations_are_collected() {
        let mut payload = base_payload();
        payload.email = "not-an-email".to_string();
        payload.full_name = "  ".to_string();
        payload.patients[0].address = "".to_string();
        payload.interventions[0].scheduled_end = payload.interventions[0].scheduled_start;

        let errors = payload.validate().unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "email",
                "full_name",
                "patients[0].address",
                "interventions[0].scheduled_end"
            ]
        );
    }

    #[test]
    fn test_rpc_params_shape() {
        let valid = base_payload().validate().unwrap();
        let params = valid.to_rpc_params();

        assert_eq!(params["p_email"], "a@b.com");
        assert_eq!(params["p_role"], "aidant");
        assert_eq!(params["p_patients_data"][0]["full_name"], "P1");
        assert_eq!(params["p_patients_data"][0]["birth_date"], "1950-01-01");
        assert_eq!(
            params["p_interventions_data"][0]["notes"][0],
            "toilette"
        );
    }

    #[test]
    fn test_summary_preserves_server_fields() {
        let summary: ImportSummary = serde_json::from_value(serde_json::json!({
            "patients_created": 1,
            "links_created": 1,
            "warnings": ["patient P1 already existed"]
        }))
        .unwrap();

        assert_eq!(summary.patients_created, 1);
        assert_eq!(summary.interventions_created, 0);
        assert!(summary.extra.contains_key("warnings"));
    }
}
