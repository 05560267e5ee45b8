//! Exploratory seeding with graceful degradation.
//!
//! The seeding path exists to get test data into a store whose
//! access-control policy is still evolving: "insert as much as the current
//! policy allows and report what didn't make it" is more useful here than
//! all-or-nothing failure. Failures are isolated per item, not per batch:
//! patient creation falls back to re-using existing visible rows, link and
//! intervention failures are logged and skipped. Intervenant creation is
//! assumed to have broader access-control allowance and has no fallback;
//! its failure aborts the run.

use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::Error;
use crate::session::StableSession;
use crate::Domicare;

/// Whatever subset of the fixture data was actually created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub patients: u32,
    pub intervenants: u32,
    pub interventions: u32,
    pub aidant_patient_links: u32,
}

#[derive(Deserialize)]
struct IdRow {
    id: Uuid,
}

/// Best-effort fixture seeder
pub struct Seeder<'a> {
    client: &'a Domicare,
}

impl<'a> Seeder<'a> {
    pub(crate) fn new(client: &'a Domicare) -> Self {
        Self { client }
    }

    /// Seed patients, intervenants, links, and interventions, degrading
    /// gracefully where the access-control policy rejects direct writes.
    pub async fn seed_test_data(&self) -> Result<SeedSummary, Error> {
        let session = self.client.stabilize_session().await?;
        let token = session.access_token.clone();
        let mut summary = SeedSummary::default();

        // The aidant row for the current identity anchors the links;
        // seeding still proceeds without it
        let aidant_id = self.find_aidant(&session, &token).await;

        let (patient_ids, patients_created) = self.seed_patients(&token).await?;
        summary.patients = patients_created;

        let (intervenant_ids, intervenants_created) = self.seed_intervenants(&token).await?;
        summary.intervenants = intervenants_created;

        match aidant_id {
            Some(aidant_id) => {
                for patient_id in &patient_ids {
                    match self.link_patient(aidant_id, *patient_id, &token).await {
                        Ok(true) => summary.aidant_patient_links += 1,
                        Ok(false) => debug!("link already exists for patient {}", patient_id),
                        Err(err) => {
                            warn!("skipping link for patient {}: {}", patient_id, err)
                        }
                    }
                }
            }
            None => warn!("no aidant row for the current identity; skipping links"),
        }

        let created_by = aidant_id
            .or_else(|| intervenant_ids.first().copied())
            .unwrap_or(session.user_id);

        for (i, patient_id) in patient_ids.iter().enumerate() {
            for (day, notes) in [(1, vec!["toilette"]), (2, vec!["repas", "médicaments"])] {
                let intervenant_id = intervenant_ids
                    .get((i + day as usize) % intervenant_ids.len().max(1))
                    .copied();
                let start = Utc::now() + ChronoDuration::days(day) + ChronoDuration::hours(9);
                let end = start + ChronoDuration::hours(1);

                let row = json!({
                    "patient_id": patient_id,
                    "intervenant_id": intervenant_id,
                    "created_by": created_by,
                    "scheduled_start": start,
                    "scheduled_end": end,
                    "status": "planned",
                    "notes": notes,
                });

                match self.insert_row("interventions", &row, &token).await {
                    Ok(_) => summary.interventions += 1,
                    Err(err) => {
                        warn!("skipping intervention for patient {}: {}", patient_id, err)
                    }
                }
            }
        }

        info!(
            "seeding done: {} patients, {} intervenants, {} interventions, {} links",
            summary.patients, summary.intervenants, summary.interventions,
            summary.aidant_patient_links
        );

        Ok(summary)
    }

    async fn find_aidant(&self, session: &StableSession, token: &str) -> Option<Uuid> {
        if let Some(id) = self
            .lookup_user_id("auth_id", &session.user_id.to_string(), token)
            .await
        {
            return Some(id);
        }
        if let Some(email) = &session.email {
            return self.lookup_user_id("email", email, token).await;
        }
        None
    }

    async fn lookup_user_id(&self, column: &str, value: &str, token: &str) -> Option<Uuid> {
        let query = match self
            .client
            .from("users")
            .select("id")
            .eq(column, value)
            .limit(1)
            .with_auth(token)
        {
            Ok(query) => query,
            Err(err) => {
                warn!("aidant lookup by {} failed: {}", column, err);
                return None;
            }
        };

        match query.execute::<IdRow>().await {
            Ok(rows) => rows.first().map(|row| row.id),
            Err(err) => {
                warn!("aidant lookup by {} failed: {}", column, err);
                None
            }
        }
    }

    // Patients are the most policy-restricted inserts; on rejection, fall
    // back to whatever rows are already visible, or none at all.
    async fn seed_patients(&self, token: &str) -> Result<(Vec<Uuid>, u32), Error> {
        let fixtures = [
            json!({
                "full_name": "Paulette Martin",
                "address": "12 rue des Lilas, 69003 Lyon",
                "birth_date": "1938-04-12",
                "medical_notes": "Diabète de type 2, mobilité réduite",
            }),
            json!({
                "full_name": "Georges Bernard",
                "address": "7 avenue Pasteur, 69100 Villeurbanne",
                "birth_date": "1945-11-02",
                "medical_notes": null,
            }),
        ];

        let mut ids = Vec::new();
        let mut created = 0;

        for fixture in &fixtures {
            match self.insert_row("patients", fixture, token).await {
                Ok(Some(id)) => {
                    ids.push(id);
                    created += 1;
                }
                Ok(None) => warn!("patient insert returned no representation"),
                Err(err) if err.is_permission_denied() => {
                    warn!("patient insert rejected by policy, re-using existing rows");
                    let existing = self.existing_patient_ids(token).await;
                    return Ok((existing, 0));
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok((ids, created))
    }

    async fn existing_patient_ids(&self, token: &str) -> Vec<Uuid> {
        let query = match self
            .client
            .from("patients")
            .select("id")
            .limit(2)
            .with_auth(token)
        {
            Ok(query) => query,
            Err(err) => {
                warn!("patient fallback lookup failed: {}", err);
                return Vec::new();
            }
        };

        match query.execute::<IdRow>().await {
            Ok(rows) => rows.into_iter().map(|row| row.id).collect(),
            Err(err) => {
                warn!("patient fallback lookup failed: {}", err);
                Vec::new()
            }
        }
    }

    // No fallback here: if intervenant rows cannot be written, nothing
    // downstream is worth attempting.
    async fn seed_intervenants(&self, token: &str) -> Result<(Vec<Uuid>, u32), Error> {
        let fixtures = [
            json!({
                "email": "claire.dubois@domicare.test",
                "full_name": "Claire Dubois",
                "role": "intervenant",
                "sub_role": "infirmier",
                "phone_number": "+33 6 12 34 56 78",
            }),
            json!({
                "email": "marc.petit@domicare.test",
                "full_name": "Marc Petit",
                "role": "intervenant",
                "sub_role": "aide-soignant",
                "phone_number": "+33 6 98 76 54 32",
            }),
        ];

        let mut ids = Vec::new();
        let mut created = 0;

        for fixture in &fixtures {
            let email = fixture["email"].as_str().unwrap_or_default();
            if let Some(existing) = self.lookup_user_id("email", email, token).await {
                debug!("intervenant {} already present", email);
                ids.push(existing);
                continue;
            }

            match self.insert_row("users", fixture, token).await {
                Ok(Some(id)) => {
                    ids.push(id);
                    created += 1;
                }
                Ok(None) => warn!("intervenant insert returned no representation"),
                Err(err) => return Err(err.into()),
            }
        }

        Ok((ids, created))
    }

    // The store does not enforce uniqueness of (aidant, patient); guard
    // here instead of piling up redundant rows. Returns false when the
    // link already existed.
    async fn link_patient(
        &self,
        aidant_id: Uuid,
        patient_id: Uuid,
        token: &str,
    ) -> Result<bool, domicare_store::StoreError> {
        let existing: Vec<IdRow> = self
            .client
            .from("aidant_patient_links")
            .select("id")
            .eq("aidant_id", &aidant_id.to_string())
            .eq("patient_id", &patient_id.to_string())
            .limit(1)
            .with_auth(token)?
            .execute()
            .await?;

        if !existing.is_empty() {
            return Ok(false);
        }

        self.client
            .from("aidant_patient_links")
            .with_auth(token)?
            .insert(json!({
                "aidant_id": aidant_id,
                "patient_id": patient_id,
            }))
            .await?;

        Ok(true)
    }

    async fn insert_row(
        &self,
        table: &str,
        row: &Value,
        token: &str,
    ) -> Result<Option<Uuid>, domicare_store::StoreError> {
        let inserted = self
            .client
            .from(table)
            .with_auth(token)?
            .insert(row)
            .await?;

        Ok(first_inserted_id(&inserted))
    }
}

// The representation comes back as an array of rows
fn first_inserted_id(value: &Value) -> Option<Uuid> {
    value
        .as_array()?
        .first()?
        .get("id")?
        .as_str()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_inserted_id_parses_representation() {
        let id = Uuid::new_v4();
        let value = json!([{ "id": id.to_string(), "full_name": "Paulette Martin" }]);
        assert_eq!(first_inserted_id(&value), Some(id));

        assert_eq!(first_inserted_id(&json!([])), None);
        assert_eq!(first_inserted_id(&Value::Null), None);
        assert_eq!(first_inserted_id(&json!([{ "id": "not-a-uuid" }])), None);
    }
}
