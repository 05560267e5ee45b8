//! Configuration options for the Domicare client

use std::time::Duration;

use crate::session::RetryOptions;

/// Configuration options for the Domicare client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Whether to automatically refresh the token
    pub auto_refresh_token: bool,

    /// Whether to keep the session cached in-process
    pub persist_session: bool,

    /// The request timeout
    pub request_timeout: Option<Duration>,

    /// Session stabilization retry budget and backoff
    pub retry: RetryOptions,

    /// Buffered capacity of the notification broadcast channel
    pub notification_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auto_refresh_token: true,
            persist_session: true,
            request_timeout: Some(Duration::from_secs(30)),
            retry: RetryOptions::default(),
            notification_capacity: 64,
        }
    }
}

impl ClientOptions {
    /// Set whether to automatically refresh the token
    pub fn with_auto_refresh_token(mut self, value: bool) -> Self {
        self.auto_refresh_token = value;
        self
    }

    /// Set whether to keep the session cached in-process
    pub fn with_persist_session(mut self, value: bool) -> Self {
        self.persist_session = value;
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, value: Option<Duration>) -> Self {
        self.request_timeout = value;
        self
    }

    /// Set the session stabilization retry options
    pub fn with_retry(mut self, value: RetryOptions) -> Self {
        self.retry = value;
        self
    }

    /// Set the notification channel capacity
    pub fn with_notification_capacity(mut self, value: usize) -> Self {
        self.notification_capacity = value;
        self
    }
}
