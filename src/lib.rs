//! Domicare Rust Client Library
//!
//! A Rust client for the Domicare home-care coordination backend,
//! providing entity store access, session management, and the
//! calendar-import reconciliation flow with its access diagnostics and
//! repair tooling.

pub mod attendance;
pub mod config;
pub mod diagnostic;
pub mod directory;
pub mod error;
pub mod import;
pub mod models;
pub mod notify;
pub mod seed;
pub mod session;

use async_trait::async_trait;
use reqwest::Client;

use domicare_auth::{Auth, AuthError, AuthOptions};
use domicare_store::StoreClient;

use crate::attendance::AttendanceService;
use crate::config::ClientOptions;
use crate::diagnostic::AccessDiagnostics;
use crate::directory::Directory;
use crate::error::Error;
use crate::import::ImportService;
use crate::notify::{NotificationHub, Notifier};
use crate::seed::Seeder;
use crate::session::{SessionStabilizer, StableSession, StoreProbe};

/// The main entry point for the Domicare Rust client
pub struct Domicare {
    /// The base URL for the Domicare backend
    pub url: String,
    /// The anonymous API key for the backend
    pub key: String,
    /// HTTP client used for requests
    pub http_client: Client,
    /// Auth client for session management
    pub auth: Auth,
    /// Client options
    pub options: ClientOptions,
}

impl Domicare {
    /// Create a new Domicare client
    ///
    /// # Arguments
    ///
    /// * `url` - The base URL of the Domicare backend
    /// * `key` - The anonymous API key for the backend
    ///
    /// # Example
    ///
    /// ```
    /// use domicare::Domicare;
    ///
    /// let domicare = Domicare::new("https://backend.domicare.example", "your-anon-key");
    /// ```
    pub fn new(url: &str, key: &str) -> Self {
        Self::new_with_options(url, key, ClientOptions::default())
    }

    /// Create a new Domicare client with custom options
    ///
    /// # Example
    ///
    /// ```
    /// use domicare::{config::ClientOptions, Domicare};
    ///
    /// let options = ClientOptions::default().with_auto_refresh_token(true);
    /// let domicare = Domicare::new_with_options(
    ///     "https://backend.domicare.example",
    ///     "your-anon-key",
    ///     options,
    /// );
    /// ```
    pub fn new_with_options(url: &str, key: &str, options: ClientOptions) -> Self {
        let mut builder = Client::builder();
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder.build().expect("failed to build HTTP client");

        let auth_options = AuthOptions {
            auto_refresh_token: options.auto_refresh_token,
            persist_session: options.persist_session,
        };
        let auth = Auth::new(url, key, http_client.clone(), auth_options);

        Self {
            url: url.to_string(),
            key: key.to_string(),
            http_client,
            auth,
            options,
        }
    }

    /// Get a reference to the auth client
    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    /// Create a new store client for a table
    pub fn from(&self, table: &str) -> StoreClient {
        StoreClient::new(&self.url, &self.key, table, self.http_client.clone())
    }

    /// Create a store client for a stored-procedure call
    pub fn rpc(&self, function: &str, params: serde_json::Value) -> StoreClient {
        StoreClient::rpc(&self.url, &self.key, function, params, self.http_client.clone())
    }

    /// The calendar-import reconciliation flow
    pub fn import(&self) -> ImportService<'_> {
        ImportService::new(self)
    }

    /// Row-level-security access diagnostics and repair
    pub fn diagnostics(&self) -> AccessDiagnostics<'_> {
        AccessDiagnostics::new(self)
    }

    /// Best-effort fixture seeding
    pub fn seeder(&self) -> Seeder<'_> {
        Seeder::new(self)
    }

    /// Read-side directory queries
    pub fn directory(&self) -> Directory<'_> {
        Directory::new(self)
    }

    /// Attendance check-in/check-out flow, fanning out onto `hub`
    pub fn attendance<'a>(&'a self, hub: &'a NotificationHub) -> AttendanceService<'a> {
        AttendanceService::new(self, hub)
    }

    /// Notification fan-out onto `hub`
    pub fn notifier<'a>(&'a self, hub: &'a NotificationHub) -> Notifier<'a> {
        Notifier::new(self, hub)
    }

    /// Create a notification hub sized from the client options
    pub fn notification_hub(&self) -> NotificationHub {
        NotificationHub::new(self.options.notification_capacity)
    }

    /// Access token of the cached session, for read paths that do not
    /// need the stabilization loop
    pub fn access_token(&self) -> Result<String, Error> {
        self.auth
            .get_session()
            .map(|session| session.access_token)
            .ok_or(Error::Auth(AuthError::MissingSession))
    }

    /// Wait for a usable session, retrying with backoff while the identity
    /// provider catches up with a recent sign-in
    pub async fn stabilize_session(&self) -> Result<StableSession, Error> {
        let stabilizer =
            SessionStabilizer::new(&self.auth, self.options.retry.clone()).with_store_probe(self);
        Ok(stabilizer.stabilize().await?)
    }
}

#[async_trait]
impl StoreProbe for Domicare {
    async fn liveness_check(&self) -> Result<(), String> {
        // Liveness probe, not a data query
        self.from("users")
            .select("id,email")
            .limit(1)
            .execute::<serde_json::Value>()
            .await
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

/// A convenience module for common imports
pub mod prelude {
    pub use crate::config::ClientOptions;
    pub use crate::error::Error;
    pub use crate::import::{ImportPayload, InterventionImport, PatientImport};
    pub use crate::models::{
        AidantPatientLink, Intervention, InterventionLog, InterventionStatus, Notification,
        NotificationKind, Patient, Role, User,
    };
    pub use crate::notify::NotificationHub;
    pub use crate::session::RetryOptions;
    pub use crate::Domicare;
}
