//! Session-stabilizing retry loop.
//!
//! Right after sign-in the identity provider's client-side session can lag
//! behind the completed authentication by a few seconds (token propagation
//! delay). Any store write attempted in that window is rejected by the
//! access-control layer with a misleading permissions error rather than an
//! auth error. The stabilizer wraps every entry point that needs a fresh
//! identity before talking to the store, and converts the confusing
//! permissions failure into either a successful deferred operation or a
//! clear, user-actionable terminal error.
//!
//! The loop is sequential and fully awaited: each probe completes before
//! the next starts, and the only way to cancel it is to drop the future.

use async_trait::async_trait;
use domicare_auth::{Auth, AuthError, Session};
use log::{debug, warn};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use uuid::Uuid;

/// Retry budget and backoff shape for session stabilization
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Fixed maximum number of probe attempts
    pub max_attempts: u32,
    /// Floor for every backoff delay
    pub base_delay: Duration,
    /// Added once per completed attempt, so delays strictly increase
    pub delay_increment: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(400),
            delay_increment: Duration::from_millis(300),
        }
    }
}

impl RetryOptions {
    /// Backoff delay after the given 1-based attempt. Pure, so the
    /// exhaustion arithmetic is testable without timers.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay + self.delay_increment * attempt
    }
}

/// The minimal identity the core flows need once the session is usable
#[derive(Debug, Clone)]
pub struct StableSession {
    pub access_token: String,
    pub user_id: Uuid,
    pub email: Option<String>,
}

impl StableSession {
    fn from_session(session: Session) -> Self {
        Self {
            access_token: session.access_token,
            user_id: session.user.id,
            email: session.user.email,
        }
    }
}

/// The three probes the stabilizer treats as independent views of the same
/// underlying fact: "is there a usable identity right now".
#[async_trait]
pub trait SessionProvider: Sync {
    /// Read the existing session; `Ok(None)` means none is present yet
    async fn read_session(&self) -> Result<Option<StableSession>, AuthError>;

    /// Exchange the refresh token for a fresh session
    async fn refresh(&self) -> Result<StableSession, AuthError>;

    /// Direct identity lookup against the auth service
    async fn fetch_user(&self) -> Result<StableSession, AuthError>;
}

#[async_trait]
impl SessionProvider for Auth {
    async fn read_session(&self) -> Result<Option<StableSession>, AuthError> {
        Ok(self.get_session().map(StableSession::from_session))
    }

    async fn refresh(&self) -> Result<StableSession, AuthError> {
        self.refresh_session().await.map(StableSession::from_session)
    }

    async fn fetch_user(&self) -> Result<StableSession, AuthError> {
        let user = self.get_user().await?;
        // get_user proves the token is accepted server-side; the token
        // itself still comes from the cached session
        let session = self.get_session().ok_or(AuthError::MissingSession)?;
        Ok(StableSession {
            access_token: session.access_token,
            user_id: user.id,
            email: user.email,
        })
    }
}

/// Trivial authenticated read used after exhaustion to tell "store
/// reachable but identity missing" apart from "store unreachable".
#[async_trait]
pub trait StoreProbe: Sync {
    async fn liveness_check(&self) -> Result<(), String>;
}

/// Probe states of the stabilization loop
#[derive(Debug)]
pub enum ProbeState {
    NoSession,
    Pending { attempt: u32 },
    Ready(StableSession),
    Exhausted,
}

/// Why stabilization gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionCause {
    /// The store answers but no usable identity exists; re-login needed
    IdentityUnavailable,
    /// Nothing answers; connectivity problem rather than an auth problem
    StoreUnreachable,
}

impl fmt::Display for ExhaustionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExhaustionCause::IdentityUnavailable => {
                write!(f, "no usable identity; please sign in again")
            }
            ExhaustionCause::StoreUnreachable => {
                write!(f, "backend unreachable; check the connection and restart the app")
            }
        }
    }
}

/// Terminal stabilization failure
#[derive(Debug, Error)]
#[error("Session not available after {attempts} attempts: {cause}")]
pub struct SessionUnstable {
    pub cause: ExhaustionCause,
    pub attempts: u32,
}

/// Drives the `NoSession -> Pending -> Ready | Exhausted` machine over a
/// [`SessionProvider`].
pub struct SessionStabilizer<'a, P: SessionProvider> {
    provider: &'a P,
    store_probe: Option<&'a dyn StoreProbe>,
    options: RetryOptions,
}

impl<'a, P: SessionProvider> SessionStabilizer<'a, P> {
    pub fn new(provider: &'a P, options: RetryOptions) -> Self {
        Self {
            provider,
            store_probe: None,
            options,
        }
    }

    /// Attach the store liveness probe used by the exhaustion diagnostic
    pub fn with_store_probe(mut self, probe: &'a dyn StoreProbe) -> Self {
        self.store_probe = Some(probe);
        self
    }

    /// Run the loop to a terminal state: a usable session or
    /// [`SessionUnstable`].
    pub async fn stabilize(&self) -> Result<StableSession, SessionUnstable> {
        let mut state = ProbeState::NoSession;
        loop {
            state = match state {
                ProbeState::NoSession => ProbeState::Pending { attempt: 1 },
                ProbeState::Pending { attempt } => match self.probe_once().await {
                    Ok(session) => ProbeState::Ready(session),
                    Err(err) => {
                        warn!(
                            "session probe {}/{} failed: {}",
                            attempt, self.options.max_attempts, err
                        );
                        if attempt >= self.options.max_attempts {
                            ProbeState::Exhausted
                        } else {
                            sleep(self.options.delay_for(attempt)).await;
                            ProbeState::Pending { attempt: attempt + 1 }
                        }
                    }
                },
                ProbeState::Ready(session) => {
                    debug!("session stabilized for {}", session.user_id);
                    return Ok(session);
                }
                ProbeState::Exhausted => return self.diagnose_exhaustion().await,
            };
        }
    }

    // One attempt, in order: read the session; on a session-missing
    // signal, refresh; fall back to a direct identity lookup.
    async fn probe_once(&self) -> Result<StableSession, AuthError> {
        let missing = match self.provider.read_session().await {
            Ok(Some(session)) => return Ok(session),
            Ok(None) => true,
            Err(err) => err.is_session_missing(),
        };

        if missing {
            match self.provider.refresh().await {
                Ok(session) => return Ok(session),
                Err(err) => debug!("session refresh failed: {}", err),
            }
        }

        self.provider.fetch_user().await
    }

    // One differentiated pass after the budget is spent. A refresh or
    // lookup succeeding here means the identity became usable just after
    // the last scheduled attempt; that counts as a late recovery.
    async fn diagnose_exhaustion(&self) -> Result<StableSession, SessionUnstable> {
        let attempts = self.options.max_attempts;

        let refresh_err = match self.provider.refresh().await {
            Ok(session) => return Ok(session),
            Err(err) => err,
        };
        let user_err = match self.provider.fetch_user().await {
            Ok(session) => return Ok(session),
            Err(err) => err,
        };

        let store_reachable = match self.store_probe {
            Some(probe) => match probe.liveness_check().await {
                Ok(()) => true,
                Err(err) => {
                    warn!("store liveness probe failed: {}", err);
                    false
                }
            },
            // Without a probe, transport-level failures on both auth calls
            // are the only unreachability signal available
            None => {
                !matches!(refresh_err, AuthError::NetworkError(_))
                    || !matches!(user_err, AuthError::NetworkError(_))
            }
        };

        warn!(
            "session exhausted after {} attempts (refresh: {}; user lookup: {})",
            attempts, refresh_err, user_err
        );

        let cause = if store_reachable {
            ExhaustionCause::IdentityUnavailable
        } else {
            ExhaustionCause::StoreUnreachable
        };

        Err(SessionUnstable { cause, attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn stable(token: &str) -> StableSession {
        StableSession {
            access_token: token.to_string(),
            user_id: Uuid::new_v4(),
            email: Some("aidant@example.com".to_string()),
        }
    }

    fn fast_options(max_attempts: u32) -> RetryOptions {
        RetryOptions {
            max_attempts,
            base_delay: Duration::from_millis(1),
            delay_increment: Duration::from_millis(1),
        }
    }

    /// Provider driven by scripted per-probe outcomes (`None` entries are
    /// failures); once a script runs dry the probe keeps failing with a
    /// session-missing condition.
    #[derive(Default)]
    struct ScriptedProvider {
        reads: Mutex<VecDeque<Option<StableSession>>>,
        refreshes: Mutex<VecDeque<Option<StableSession>>>,
        fetches: Mutex<VecDeque<Option<StableSession>>>,
        read_calls: AtomicU32,
        refresh_calls: AtomicU32,
        fetch_calls: AtomicU32,
    }

    #[async_trait]
    impl SessionProvider for ScriptedProvider {
        async fn read_session(&self) -> Result<Option<StableSession>, AuthError> {
            self.read_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reads.lock().unwrap().pop_front().flatten())
        }

        async fn refresh(&self) -> Result<StableSession, AuthError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refreshes
                .lock()
                .unwrap()
                .pop_front()
                .flatten()
                .ok_or(AuthError::MissingSession)
        }

        async fn fetch_user(&self) -> Result<StableSession, AuthError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.fetches
                .lock()
                .unwrap()
                .pop_front()
                .flatten()
                .ok_or(AuthError::MissingSession)
        }
    }

    struct FixedProbe(Result<(), String>);

    #[async_trait]
    impl StoreProbe for FixedProbe {
        async fn liveness_check(&self) -> Result<(), String> {
            self.0.clone()
        }
    }

    #[test]
    fn test_delay_is_strictly_increasing() {
        let options = RetryOptions::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..=options.max_attempts {
            let delay = options.delay_for(attempt);
            assert!(delay > previous, "delay must grow at attempt {}", attempt);
            previous = delay;
        }
        assert_eq!(
            options.delay_for(1),
            Duration::from_millis(700),
            "base plus one increment"
        );
    }

    #[tokio::test]
    async fn test_always_failing_provider_terminates() {
        let provider = ScriptedProvider::default();
        let probe = FixedProbe(Ok(()));
        let stabilizer =
            SessionStabilizer::new(&provider, fast_options(3)).with_store_probe(&probe);

        let err = stabilizer.stabilize().await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.cause, ExhaustionCause::IdentityUnavailable);
        // 3 scheduled attempts plus one diagnostic pass
        assert_eq!(provider.read_calls.load(Ordering::SeqCst), 3);
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 4);
        assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_late_session_succeeds_within_budget() {
        let provider = ScriptedProvider::default();
        // First two reads find nothing, the third finds a session
        provider
            .reads
            .lock()
            .unwrap()
            .extend([None, None, Some(stable("tok-late"))]);

        let stabilizer = SessionStabilizer::new(&provider, fast_options(5));

        let session = stabilizer.stabilize().await.unwrap();
        assert_eq!(session.access_token, "tok-late");
        assert_eq!(provider.read_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_refresh_fallback_is_used_on_missing_session() {
        let provider = ScriptedProvider::default();
        provider
            .refreshes
            .lock()
            .unwrap()
            .push_back(Some(stable("tok-r")));

        let stabilizer = SessionStabilizer::new(&provider, fast_options(2));

        let session = stabilizer.stabilize().await.unwrap();
        assert_eq!(session.access_token, "tok-r");
        assert_eq!(provider.read_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        // Refresh succeeded, so the direct lookup was never needed
        assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_with_dead_store_is_unreachable() {
        let provider = ScriptedProvider::default();
        let probe = FixedProbe(Err("connection refused".to_string()));
        let stabilizer =
            SessionStabilizer::new(&provider, fast_options(2)).with_store_probe(&probe);

        let err = stabilizer.stabilize().await.unwrap_err();
        assert_eq!(err.cause, ExhaustionCause::StoreUnreachable);
        assert!(err.to_string().contains("backend unreachable"));
    }

    #[tokio::test]
    async fn test_diagnostic_pass_allows_late_recovery() {
        let provider = ScriptedProvider::default();
        // Refresh fails during the single scheduled attempt, then succeeds
        // on the exhaustion diagnostic's re-try: the token propagated just
        // after the budget ran out
        provider
            .refreshes
            .lock()
            .unwrap()
            .extend([None, Some(stable("tok-recovered"))]);

        let stabilizer = SessionStabilizer::new(&provider, fast_options(1));

        let session = stabilizer.stabilize().await.unwrap();
        assert_eq!(session.access_token, "tok-recovered");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 2);
        // Attempt 1 fell through to the user lookup; the diagnostic pass
        // stopped at the successful refresh
        assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 1);
    }
}
