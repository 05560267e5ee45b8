//! Access diagnostics for row-level-security visibility.
//!
//! The store's access-control policy conditions row visibility on the
//! `users.auth_id` column matching the caller's session identity. A user
//! row created out-of-band (import, direct insert) can end up with a null
//! or stale `auth_id`, which produces a confusing "signed in but sees
//! nothing" state. The diagnostic makes that silent failure mode
//! observable; the repair procedure fixes it.
//!
//! Diagnostics are best-effort by contract: they never return `Err`, every
//! failure is folded into the report's `error` field so the caller can
//! render whatever was gathered.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Error;
use crate::models::User;
use crate::Domicare;

/// The user-row side of the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccessInfo {
    pub id: Uuid,
    pub email: String,
    pub auth_id: Option<Uuid>,
    pub auth_id_matches: bool,
}

/// Row counts reachable from the user, a proxy for "will this user
/// actually see data in the UI"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAccessCounts {
    pub links_count: u64,
    pub interventions_count: u64,
}

/// Structured diagnostic result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub success: bool,
    #[serde(default)]
    pub auth_uid: Option<Uuid>,
    #[serde(default)]
    pub user_found: bool,
    #[serde(default)]
    pub user_info: Option<UserAccessInfo>,
    #[serde(default)]
    pub data_access: Option<DataAccessCounts>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DiagnosticReport {
    fn failure(error: String) -> Self {
        Self {
            success: false,
            auth_uid: None,
            user_found: false,
            user_info: None,
            data_access: None,
            error: Some(error),
        }
    }
}

/// Result of the `fix_missing_auth_ids` repair procedure
#[derive(Debug, Clone, Deserialize)]
pub struct RepairSummary {
    #[serde(default)]
    pub repaired: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize)]
struct IdRow {
    #[allow(dead_code)]
    id: Uuid,
}

#[derive(Deserialize)]
struct LinkRow {
    #[allow(dead_code)]
    id: Uuid,
    patient_id: Uuid,
}

/// Inspects whether the current session identity is correctly linked and
/// actually sees rows under the access-control policy
pub struct AccessDiagnostics<'a> {
    client: &'a Domicare,
}

impl<'a> AccessDiagnostics<'a> {
    pub(crate) fn new(client: &'a Domicare) -> Self {
        Self { client }
    }

    /// Run the diagnostic for the current session identity. Never fails;
    /// store errors land in the report's `error` field.
    pub async fn diagnose(&self) -> DiagnosticReport {
        let session = match self.client.auth().get_session() {
            Some(session) => session,
            None => return DiagnosticReport::failure("no active session".to_string()),
        };
        let auth_uid = session.user.id;

        // The server-side procedure sees through the same policies the app
        // runs under; prefer its view, assemble client-side when it is
        // unavailable
        match self.diagnose_via_procedure(&session.access_token).await {
            Ok(mut report) => {
                if report.auth_uid.is_none() {
                    report.auth_uid = Some(auth_uid);
                }
                report
            }
            Err(err) => {
                warn!(
                    "diagnose_rls_for_user procedure unavailable, assembling client-side: {}",
                    err
                );
                self.diagnose_client_side(auth_uid, session.user.email.as_deref(), &session.access_token)
                    .await
            }
        }
    }

    async fn diagnose_via_procedure(&self, token: &str) -> Result<DiagnosticReport, Error> {
        let report = self
            .client
            .rpc("diagnose_rls_for_user", Value::Object(Map::new()))
            .with_auth(token)?
            .call_rpc::<DiagnosticReport>()
            .await?;
        Ok(report)
    }

    async fn diagnose_client_side(
        &self,
        auth_uid: Uuid,
        email: Option<&str>,
        token: &str,
    ) -> DiagnosticReport {
        let mut report = DiagnosticReport {
            success: false,
            auth_uid: Some(auth_uid),
            user_found: false,
            user_info: None,
            data_access: None,
            error: None,
        };

        let user = match self.find_user(auth_uid, email, token).await {
            Ok(user) => user,
            Err(err) => {
                report.error = Some(err.to_string());
                return report;
            }
        };

        let user = match user {
            Some(user) => user,
            None => {
                report.error = Some(format!("no user row for auth id {}", auth_uid));
                return report;
            }
        };

        report.user_found = true;
        report.user_info = Some(UserAccessInfo {
            id: user.id,
            email: user.email.clone(),
            auth_id: user.auth_id,
            auth_id_matches: user.auth_id_matches(auth_uid),
        });

        match self.count_reachable(user.id, token).await {
            Ok(counts) => {
                report.data_access = Some(counts);
                report.success = true;
            }
            Err(err) => {
                report.error = Some(err.to_string());
            }
        }

        report
    }

    // By auth_id first; rows created out-of-band may only be findable by
    // email (auth_id null is exactly the fault being diagnosed)
    async fn find_user(
        &self,
        auth_uid: Uuid,
        email: Option<&str>,
        token: &str,
    ) -> Result<Option<User>, Error> {
        let mut rows: Vec<User> = self
            .client
            .from("users")
            .select("*")
            .eq("auth_id", &auth_uid.to_string())
            .limit(1)
            .with_auth(token)?
            .execute()
            .await?;

        if rows.is_empty() {
            if let Some(email) = email {
                rows = self
                    .client
                    .from("users")
                    .select("*")
                    .eq("email", email)
                    .limit(1)
                    .with_auth(token)?
                    .execute()
                    .await?;
            }
        }

        Ok(rows.pop())
    }

    async fn count_reachable(&self, user_id: Uuid, token: &str) -> Result<DataAccessCounts, Error> {
        let links: Vec<LinkRow> = self
            .client
            .from("aidant_patient_links")
            .select("id,patient_id")
            .eq("aidant_id", &user_id.to_string())
            .with_auth(token)?
            .execute()
            .await?;

        let links_count = links.len() as u64;

        let interventions_count = if links.is_empty() {
            0
        } else {
            let patient_ids: Vec<String> =
                links.iter().map(|l| l.patient_id.to_string()).collect();
            let id_refs: Vec<&str> = patient_ids.iter().map(String::as_str).collect();
            let rows: Vec<IdRow> = self
                .client
                .from("interventions")
                .select("id")
                .in_list("patient_id", &id_refs)
                .with_auth(token)?
                .execute()
                .await?;
            rows.len() as u64
        };

        Ok(DataAccessCounts {
            links_count,
            interventions_count,
        })
    }

    /// Bulk-repair `auth_id` mismatches through the server-side procedure.
    /// Unlike [`AccessDiagnostics::diagnose`] this is a mutation and does
    /// fail loudly.
    pub async fn repair_auth_ids(&self) -> Result<RepairSummary, Error> {
        let session = self.client.stabilize_session().await?;

        let summary: RepairSummary = self
            .client
            .rpc("fix_missing_auth_ids", Value::Object(Map::new()))
            .with_auth(&session.access_token)?
            .call_rpc()
            .await?;

        info!("auth id repair touched {} rows", summary.repaired);
        Ok(summary)
    }
}
