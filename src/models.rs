//! Domain entities persisted in the Domicare entity store.
//!
//! These mirror the store's row shapes one-to-one; the client never caches
//! them beyond the lifetime of a single operation.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Caregiver role carried by a completed user profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Informal/family caregiver; sees only patients explicitly linked to them
    Aidant,
    /// Professional care worker; sees interventions assigned to them
    Intervenant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Aidant => write!(f, "aidant"),
            Role::Intervenant => write!(f, "intervenant"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aidant" => Ok(Role::Aidant),
            "intervenant" => Ok(Role::Intervenant),
            other => Err(format!("Unknown role: {}", other)),
        }
    }
}

/// Identity record in the entity store.
///
/// `auth_id` must equal the session-layer identity id for the user's own
/// rows to be visible to them under row-level security; a null or
/// mismatched value is a detectable, repairable fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub auth_id: Option<Uuid>,
    pub email: String,
    pub full_name: String,
    pub role: Option<Role>,
    pub sub_role: Option<String>,
    pub phone_number: Option<String>,
}

impl User {
    /// A user without a role has not completed their profile and must be
    /// excluded from role-gated listings.
    pub fn is_complete(&self) -> bool {
        self.role.is_some()
    }

    /// Whether this row is visible to the given session identity under
    /// the store's access-control policy.
    pub fn auth_id_matches(&self, auth_uid: Uuid) -> bool {
        self.auth_id == Some(auth_uid)
    }
}

/// A cared-for individual
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub full_name: String,
    pub address: String,
    pub birth_date: NaiveDate,
    pub medical_notes: Option<String>,
}

/// Join entity granting an aidant visibility into a patient's interventions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AidantPatientLink {
    pub id: Uuid,
    pub aidant_id: Uuid,
    pub patient_id: Uuid,
}

/// Lifecycle status of an intervention.
///
/// Transitions are one-way: a planned visit completes (`done`) or is never
/// attended (`missed`); there is no reset path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    Planned,
    Done,
    Missed,
}

impl InterventionStatus {
    /// Whether the lifecycle allows moving from `self` to `to`.
    pub fn can_transition(self, to: InterventionStatus) -> bool {
        matches!(
            (self, to),
            (InterventionStatus::Planned, InterventionStatus::Done)
                | (InterventionStatus::Planned, InterventionStatus::Missed)
        )
    }
}

impl fmt::Display for InterventionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterventionStatus::Planned => write!(f, "planned"),
            InterventionStatus::Done => write!(f, "done"),
            InterventionStatus::Missed => write!(f, "missed"),
        }
    }
}

/// A scheduled or completed home-care visit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub id: Uuid,
    pub patient_id: Uuid,
    /// May be unassigned
    pub intervenant_id: Option<Uuid>,
    pub created_by: Uuid,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub status: InterventionStatus,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Attendance record for one intervention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionLog {
    pub id: Uuid,
    pub intervention_id: Uuid,
    pub check_in: Option<DateTime<Utc>>,
    pub check_out: Option<DateTime<Utc>>,
    pub remarks: Option<String>,
}

impl InterventionLog {
    /// An open log has a check-in but no check-out yet; check-out updates
    /// it in place instead of creating a second record.
    pub fn is_open(&self) -> bool {
        self.check_in.is_some() && self.check_out.is_none()
    }
}

/// Kind of intervention state change fanned out to linked aidants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CheckIn,
    CheckOut,
    Missed,
}

/// Fan-out record for one aidant about one intervention state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub aidant_id: Uuid,
    pub intervention_id: Uuid,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub sent_at: DateTime<Utc>,
}
