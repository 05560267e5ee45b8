//! Attendance check-in/check-out for interventions.
//!
//! A visit produces one attendance log: created at check-in with an open
//! check-out, closed in place at check-out. When events arrive out of
//! order (a check-out with no open log), a fresh log carrying only the
//! check-out is recorded instead of failing the visit. Status changes go
//! through the one-way lifecycle in [`crate::models::InterventionStatus`];
//! a forbidden transition is an error, never a silent overwrite.

use chrono::Utc;
use log::debug;
use serde_json::json;
use uuid::Uuid;

use domicare_store::{SortOrder, StoreError};

use crate::error::Error;
use crate::models::{Intervention, InterventionLog, InterventionStatus, NotificationKind};
use crate::notify::{NotificationHub, Notifier};
use crate::Domicare;

/// Check-in/check-out flow for intervenants
pub struct AttendanceService<'a> {
    client: &'a Domicare,
    hub: &'a NotificationHub,
}

impl<'a> AttendanceService<'a> {
    pub(crate) fn new(client: &'a Domicare, hub: &'a NotificationHub) -> Self {
        Self { client, hub }
    }

    /// Open an attendance log for the intervention and notify linked
    /// aidants.
    pub async fn check_in(&self, intervention_id: Uuid) -> Result<InterventionLog, Error> {
        let session = self.client.stabilize_session().await?;
        let token = &session.access_token;

        let intervention = self.fetch_intervention(intervention_id, token).await?;

        let inserted = self
            .client
            .from("intervention_logs")
            .with_auth(token)?
            .insert(json!({
                "intervention_id": intervention_id,
                "check_in": Utc::now(),
                "check_out": null,
                "remarks": null,
            }))
            .await?;
        let log = first_row(inserted)?;

        Notifier::new(self.client, self.hub)
            .notify_linked_aidants(
                token,
                intervention.patient_id,
                intervention_id,
                NotificationKind::CheckIn,
            )
            .await?;

        Ok(log)
    }

    /// Close the open attendance log (or record a lone check-out when none
    /// is open), mark the intervention done, and notify linked aidants.
    pub async fn check_out(
        &self,
        intervention_id: Uuid,
        remarks: Option<&str>,
    ) -> Result<InterventionLog, Error> {
        let session = self.client.stabilize_session().await?;
        let token = &session.access_token;

        let intervention = self.fetch_intervention(intervention_id, token).await?;

        // A missed visit cannot be completed after the fact
        if intervention.status != InterventionStatus::Done
            && !intervention.status.can_transition(InterventionStatus::Done)
        {
            return Err(Error::InvalidTransition {
                from: intervention.status,
                to: InterventionStatus::Done,
            });
        }

        let now = Utc::now();
        let log = match self.open_log(intervention_id, token).await? {
            Some(open) => {
                let updated = self
                    .client
                    .from("intervention_logs")
                    .eq("id", &open.id.to_string())
                    .with_auth(token)?
                    .update(json!({
                        "check_out": now,
                        "remarks": remarks,
                    }))
                    .await?;
                first_row(updated)?
            }
            None => {
                // Out-of-order event: no open log to close, record the
                // check-out on its own
                let inserted = self
                    .client
                    .from("intervention_logs")
                    .with_auth(token)?
                    .insert(json!({
                        "intervention_id": intervention_id,
                        "check_in": null,
                        "check_out": now,
                        "remarks": remarks,
                    }))
                    .await?;
                first_row(inserted)?
            }
        };

        if intervention.status.can_transition(InterventionStatus::Done) {
            self.client
                .from("interventions")
                .eq("id", &intervention_id.to_string())
                .with_auth(token)?
                .update(json!({ "status": "done" }))
                .await?;
        } else {
            debug!("intervention {} already done", intervention_id);
        }

        Notifier::new(self.client, self.hub)
            .notify_linked_aidants(
                token,
                intervention.patient_id,
                intervention_id,
                NotificationKind::CheckOut,
            )
            .await?;

        Ok(log)
    }

    /// Mark a never-attended intervention missed and notify linked
    /// aidants. Marking an already-missed intervention is a no-op.
    pub async fn mark_missed(&self, intervention_id: Uuid) -> Result<(), Error> {
        let session = self.client.stabilize_session().await?;
        let token = &session.access_token;

        let intervention = self.fetch_intervention(intervention_id, token).await?;

        if !intervention
            .status
            .can_transition(InterventionStatus::Missed)
        {
            if intervention.status == InterventionStatus::Missed {
                debug!("intervention {} already missed", intervention_id);
                return Ok(());
            }
            return Err(Error::InvalidTransition {
                from: intervention.status,
                to: InterventionStatus::Missed,
            });
        }

        self.client
            .from("interventions")
            .eq("id", &intervention_id.to_string())
            .with_auth(token)?
            .update(json!({ "status": "missed" }))
            .await?;

        Notifier::new(self.client, self.hub)
            .notify_linked_aidants(
                token,
                intervention.patient_id,
                intervention_id,
                NotificationKind::Missed,
            )
            .await?;

        Ok(())
    }

    async fn fetch_intervention(
        &self,
        intervention_id: Uuid,
        token: &str,
    ) -> Result<Intervention, Error> {
        let rows: Vec<Intervention> = self
            .client
            .from("interventions")
            .select("*")
            .eq("id", &intervention_id.to_string())
            .limit(1)
            .with_auth(token)?
            .execute()
            .await?;

        rows.into_iter().next().ok_or(Error::RowNotFound {
            table: "interventions",
            id: intervention_id.to_string(),
        })
    }

    // Most recent log with a check-in and no check-out
    async fn open_log(
        &self,
        intervention_id: Uuid,
        token: &str,
    ) -> Result<Option<InterventionLog>, Error> {
        let rows: Vec<InterventionLog> = self
            .client
            .from("intervention_logs")
            .select("*")
            .eq("intervention_id", &intervention_id.to_string())
            .is_null("check_out")
            .order("check_in", SortOrder::Descending)
            .limit(1)
            .with_auth(token)?
            .execute()
            .await?;

        Ok(rows.into_iter().find(|log| log.is_open()))
    }
}

fn first_row(value: serde_json::Value) -> Result<InterventionLog, Error> {
    let row = value
        .as_array()
        .and_then(|rows| rows.first())
        .cloned()
        .ok_or_else(|| {
            StoreError::DeserializationError("write returned no representation".to_string())
        })?;
    serde_json::from_value(row)
        .map_err(|e| StoreError::DeserializationError(e.to_string()).into())
}
