//! Read-side directory over the entity store.
//!
//! One data-access service with a capability probe: the joined query is
//! attempted first, and a policy rejection on the join table downgrades to
//! the unjoined two-step path instead of failing the screen.

use chrono::{DateTime, Utc};
use log::warn;
use serde::Deserialize;
use uuid::Uuid;

use domicare_store::SortOrder;

use crate::error::Error;
use crate::models::{Intervention, Patient, User};
use crate::Domicare;

#[derive(Deserialize)]
struct JoinedPatientRow {
    patient: Patient,
}

#[derive(Deserialize)]
struct PatientIdRow {
    patient_id: Uuid,
}

/// Read-side queries used by list and calendar screens
pub struct Directory<'a> {
    client: &'a Domicare,
}

impl<'a> Directory<'a> {
    pub(crate) fn new(client: &'a Domicare) -> Self {
        Self { client }
    }

    /// Patients visible to an aidant through their links.
    pub async fn patients_for_aidant(&self, aidant_id: Uuid) -> Result<Vec<Patient>, Error> {
        let token = self.client.access_token()?;

        let joined = self
            .client
            .from("aidant_patient_links")
            .select("patient:patients(id,full_name,address,birth_date,medical_notes)")
            .eq("aidant_id", &aidant_id.to_string())
            .with_auth(&token)?
            .execute::<JoinedPatientRow>()
            .await;

        match joined {
            Ok(rows) => Ok(rows.into_iter().map(|row| row.patient).collect()),
            Err(err) if err.is_permission_denied() => {
                warn!("joined patient query rejected by policy, using two-step fallback");
                self.patients_unjoined(aidant_id, &token).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn patients_unjoined(
        &self,
        aidant_id: Uuid,
        token: &str,
    ) -> Result<Vec<Patient>, Error> {
        let links: Vec<PatientIdRow> = self
            .client
            .from("aidant_patient_links")
            .select("patient_id")
            .eq("aidant_id", &aidant_id.to_string())
            .with_auth(token)?
            .execute()
            .await?;

        if links.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = links.iter().map(|l| l.patient_id.to_string()).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let patients: Vec<Patient> = self
            .client
            .from("patients")
            .select("*")
            .in_list("id", &id_refs)
            .with_auth(token)?
            .execute()
            .await?;

        Ok(patients)
    }

    /// Interventions for one patient, oldest first.
    pub async fn interventions_for_patient(
        &self,
        patient_id: Uuid,
    ) -> Result<Vec<Intervention>, Error> {
        let token = self.client.access_token()?;

        let rows: Vec<Intervention> = self
            .client
            .from("interventions")
            .select("*")
            .eq("patient_id", &patient_id.to_string())
            .order("scheduled_start", SortOrder::Ascending)
            .with_auth(&token)?
            .execute()
            .await?;

        Ok(rows)
    }

    /// Interventions whose start falls within a calendar range.
    pub async fn interventions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Intervention>, Error> {
        let token = self.client.access_token()?;

        let rows: Vec<Intervention> = self
            .client
            .from("interventions")
            .select("*")
            .gte("scheduled_start", &start.to_rfc3339())
            .lte("scheduled_start", &end.to_rfc3339())
            .order("scheduled_start", SortOrder::Ascending)
            .with_auth(&token)?
            .execute()
            .await?;

        Ok(rows)
    }

    /// Professional care workers with a completed profile. Users whose
    /// role is still null are profile stubs and stay out of role-gated
    /// listings.
    pub async fn intervenants(&self) -> Result<Vec<User>, Error> {
        let token = self.client.access_token()?;

        let users: Vec<User> = self
            .client
            .from("users")
            .select("*")
            .eq("role", "intervenant")
            .with_auth(&token)?
            .execute()
            .await?;

        Ok(users.into_iter().filter(|u| u.is_complete()).collect())
    }
}
