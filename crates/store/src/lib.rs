//! Domicare entity store client
//!
//! PostgREST-style client for the hosted relational store backing
//! Domicare, allowing for querying, filtering, and manipulating rows.
//!
//! # Features
//!
//! - Query API (`select`, `insert`, `update`)
//! - Filtering (`eq`, `gte`, `lte`, `in_list`)
//! - Ordering and pagination
//! - Stored-procedure (RPC) calls
//! - Structured API error details with a permission-denial classifier

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use url::Url;

/// Detailed error information returned by the store API
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoreApiErrorDetails {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<String>,
    pub hint: Option<String>,
}

impl fmt::Display for StoreApiErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(code) = &self.code {
            parts.push(format!("Code: {}", code));
        }
        if let Some(message) = &self.message {
            parts.push(format!("Message: {}", message));
        }
        if let Some(details) = &self.details {
            parts.push(format!("Details: {}", details));
        }
        if let Some(hint) = &self.hint {
            parts.push(format!("Hint: {}", hint));
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// Postgres error code raised when row-level security rejects a write.
const PG_INSUFFICIENT_PRIVILEGE: &str = "42501";

/// Error type
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("API error: {details} (Status: {status})")]
    ApiError {
        details: StoreApiErrorDetails,
        status: reqwest::StatusCode,
    },

    #[error("API error (unparsed): {message} (Status: {status})")]
    UnparsedApiError {
        message: String,
        status: reqwest::StatusCode,
    },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl StoreError {
    /// True when the store accepted the request shape but the access-control
    /// policy refused it. Callers with degraded-mode fallbacks (seeding,
    /// joined-query probes) branch on this instead of string-matching.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            StoreError::ApiError { details, status } => {
                status.as_u16() == 401
                    || status.as_u16() == 403
                    || details.code.as_deref() == Some(PG_INSUFFICIENT_PRIVILEGE)
            }
            StoreError::UnparsedApiError { status, .. } => {
                status.as_u16() == 401 || status.as_u16() == 403
            }
            _ => false,
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Entity store client, one instance per table or procedure call
pub struct StoreClient {
    base_url: String,
    api_key: String,
    table: String,
    http_client: Client,
    headers: HeaderMap,
    query_params: HashMap<String, String>,
    is_rpc: bool,
    rpc_params: Option<Value>,
}

impl StoreClient {
    /// Create a new store client for a table
    pub fn new(base_url: &str, api_key: &str, table: &str, http_client: Client) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(api_key).unwrap());
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));

        Self {
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            table: table.to_string(),
            http_client,
            headers,
            query_params: HashMap::new(),
            is_rpc: false,
            rpc_params: None,
        }
    }

    /// Create a client for a stored-procedure call
    pub fn rpc(
        base_url: &str,
        api_key: &str,
        function_name: &str,
        params: Value,
        http_client: Client,
    ) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(api_key).unwrap());
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));

        Self {
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            table: function_name.to_string(),
            http_client,
            headers,
            query_params: HashMap::new(),
            is_rpc: true,
            rpc_params: Some(params),
        }
    }

    /// Add a header
    pub fn with_header(mut self, key: &str, value: &str) -> Result<Self, StoreError> {
        let header_value = HeaderValue::from_str(value).map_err(|_| {
            StoreError::InvalidParameters(format!("Invalid header value: {}", value))
        })?;

        let header_name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| StoreError::InvalidParameters(format!("Invalid header name: {}", key)))?;

        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// Set the caller's access token; required for any row governed by
    /// row-level security
    pub fn with_auth(self, token: &str) -> Result<Self, StoreError> {
        self.with_header("Authorization", &format!("Bearer {}", token))
    }

    /// Choose the columns to return
    pub fn select(mut self, columns: &str) -> Self {
        self.query_params
            .insert("select".to_string(), columns.to_string());
        self
    }

    /// Equality filter
    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.query_params
            .insert(column.to_string(), format!("eq.{}", value));
        self
    }

    /// Greater-than-or-equal filter
    pub fn gte(mut self, column: &str, value: &str) -> Self {
        self.query_params
            .insert(column.to_string(), format!("gte.{}", value));
        self
    }

    /// Less-than-or-equal filter
    pub fn lte(mut self, column: &str, value: &str) -> Self {
        self.query_params
            .insert(column.to_string(), format!("lte.{}", value));
        self
    }

    /// IN filter
    pub fn in_list(mut self, column: &str, values: &[&str]) -> Self {
        let value_list = values.join(",");
        self.query_params
            .insert(column.to_string(), format!("in.({})", value_list));
        self
    }

    /// IS filter (`is.null` in particular)
    pub fn is_null(mut self, column: &str) -> Self {
        self.query_params
            .insert(column.to_string(), "is.null".to_string());
        self
    }

    /// Sort order
    pub fn order(mut self, column: &str, order: SortOrder) -> Self {
        let order_str = match order {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        };
        self.query_params
            .insert("order".to_string(), format!("{}.{}", column, order_str));
        self
    }

    /// Limit the number of returned rows
    pub fn limit(mut self, count: i32) -> Self {
        self.query_params
            .insert("limit".to_string(), count.to_string());
        self
    }

    /// Skip the first rows of the result
    pub fn offset(mut self, count: i32) -> Self {
        self.query_params
            .insert("offset".to_string(), count.to_string());
        self
    }

    /// Fetch rows
    pub async fn execute<T: for<'de> Deserialize<'de>>(&self) -> Result<Vec<T>, StoreError> {
        let url = self.build_url()?;

        let response = self
            .http_client
            .get(&url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(StoreError::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(Self::api_error(status, error_text));
        }

        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    /// Insert rows; returns the inserted representation
    pub async fn insert<T: Serialize>(&self, values: T) -> Result<Value, StoreError> {
        let url = self.build_url()?;

        let mut headers = self.headers.clone();
        headers.insert(
            HeaderName::from_static("prefer"),
            HeaderValue::from_static("return=representation"),
        );

        let response = self
            .http_client
            .post(&url)
            .headers(headers)
            .json(&values)
            .send()
            .await
            .map_err(StoreError::NetworkError)?;

        self.read_write_response(response).await
    }

    /// Update rows matched by the current filters; returns the updated
    /// representation
    pub async fn update<T: Serialize>(&self, values: T) -> Result<Value, StoreError> {
        let url = self.build_url()?;

        let mut headers = self.headers.clone();
        headers.insert(
            HeaderName::from_static("prefer"),
            HeaderValue::from_static("return=representation"),
        );

        let response = self
            .http_client
            .patch(&url)
            .headers(headers)
            .json(&values)
            .send()
            .await
            .map_err(StoreError::NetworkError)?;

        self.read_write_response(response).await
    }

    /// Call a stored procedure (POST request)
    pub async fn call_rpc<T: for<'de> Deserialize<'de>>(&self) -> Result<T, StoreError> {
        if !self.is_rpc {
            return Err(StoreError::InvalidParameters(
                "Client was not created for RPC. Use StoreClient::rpc().".to_string(),
            ));
        }
        // For RPC the table slot carries the function name
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, self.table);
        let params = self
            .rpc_params
            .as_ref()
            .ok_or_else(|| StoreError::InvalidParameters("RPC parameters are missing.".to_string()))?;

        let response = self
            .http_client
            .post(&url)
            .headers(self.headers.clone())
            .json(params)
            .send()
            .await
            .map_err(StoreError::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(Self::api_error(status, error_text));
        }

        response.json::<T>().await.map_err(|e| {
            StoreError::DeserializationError(format!("Failed to deserialize RPC response: {}", e))
        })
    }

    // Shared body handling for insert/update: a success body may legally be
    // empty (204 No Content), which is not a deserialization failure.
    async fn read_write_response(&self, response: reqwest::Response) -> Result<Value, StoreError> {
        let status = response.status();

        if status.is_success() {
            let body_text = response.text().await.map_err(|e| {
                StoreError::DeserializationError(format!("Failed to read response body: {}", e))
            })?;

            if body_text.trim().is_empty() {
                Ok(Value::Null)
            } else {
                serde_json::from_str::<Value>(&body_text)
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))
            }
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            Err(Self::api_error(status, error_text))
        }
    }

    // Attempt to parse structured error details; fall back to the raw body.
    fn api_error(status: reqwest::StatusCode, error_text: String) -> StoreError {
        match serde_json::from_str::<StoreApiErrorDetails>(&error_text) {
            Ok(details) => StoreError::ApiError { details, status },
            Err(_) => StoreError::UnparsedApiError {
                message: error_text,
                status,
            },
        }
    }

    fn build_url(&self) -> Result<String, StoreError> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, self.table))?;

        for (key, value) in &self.query_params {
            url.query_pairs_mut().append_pair(key, value);
        }

        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize)]
    struct IdRow {
        id: String,
    }

    #[test]
    fn test_execute_with_filters() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;

            Mock::given(method("GET"))
                .and(path("/rest/v1/patients"))
                .and(query_param("select", "id"))
                .and(query_param("full_name", "eq.Paulette Martin"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(json!([{ "id": "p-1" }])),
                )
                .mount(&mock_server)
                .await;

            let rows: Vec<IdRow> = StoreClient::new(
                &mock_server.uri(),
                "test_key",
                "patients",
                Client::new(),
            )
            .select("id")
            .eq("full_name", "Paulette Martin")
            .execute()
            .await
            .unwrap();

            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].id, "p-1");
        });
    }

    #[test]
    fn test_insert_permission_denied() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;

            Mock::given(method("POST"))
                .and(path("/rest/v1/patients"))
                .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                    "code": "42501",
                    "message": "new row violates row-level security policy for table \"patients\"",
                    "details": null,
                    "hint": null
                })))
                .mount(&mock_server)
                .await;

            let err = StoreClient::new(
                &mock_server.uri(),
                "test_key",
                "patients",
                Client::new(),
            )
            .insert(json!({ "full_name": "Paulette Martin" }))
            .await
            .unwrap_err();

            assert!(err.is_permission_denied());
            match err {
                StoreError::ApiError { details, status } => {
                    assert_eq!(status.as_u16(), 403);
                    assert_eq!(details.code.as_deref(), Some("42501"));
                }
                other => panic!("expected ApiError, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_call_rpc_roundtrip() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;

            let params = json!({ "p_email": "a@b.com" });

            Mock::given(method("POST"))
                .and(path("/rest/v1/rpc/diagnose_rls_for_user"))
                .and(body_json(&params))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(json!({ "success": true })),
                )
                .mount(&mock_server)
                .await;

            let result: Value = StoreClient::rpc(
                &mock_server.uri(),
                "test_key",
                "diagnose_rls_for_user",
                params.clone(),
                Client::new(),
            )
            .call_rpc()
            .await
            .unwrap();

            assert_eq!(result["success"], json!(true));
        });
    }

    #[test]
    fn test_limit_and_offset_paginate() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;

            Mock::given(method("GET"))
                .and(path("/rest/v1/interventions"))
                .and(query_param("limit", "10"))
                .and(query_param("offset", "20"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(json!([{ "id": "i-21" }])),
                )
                .mount(&mock_server)
                .await;

            let rows: Vec<IdRow> = StoreClient::new(
                &mock_server.uri(),
                "test_key",
                "interventions",
                Client::new(),
            )
            .select("id")
            .limit(10)
            .offset(20)
            .execute()
            .await
            .unwrap();

            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].id, "i-21");
        });
    }

    #[test]
    fn test_rpc_on_table_client_is_invalid() {
        tokio_test::block_on(async {
            let client = StoreClient::new("http://localhost:0", "k", "users", Client::new());
            let err = client.call_rpc::<Value>().await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidParameters(_)));
        });
    }

    #[test]
    fn test_unparsed_error_permission_classifier() {
        let err = StoreClient::api_error(
            reqwest::StatusCode::UNAUTHORIZED,
            "permission denied".to_string(),
        );
        assert!(err.is_permission_denied());

        let err = StoreClient::api_error(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "boom".to_string(),
        );
        assert!(!err.is_permission_denied());
    }

    #[test]
    fn test_error_details_display() {
        let details = StoreApiErrorDetails {
            code: Some("42501".to_string()),
            message: Some("permission denied".to_string()),
            details: None,
            hint: Some("check your policies".to_string()),
        };
        assert_eq!(
            details.to_string(),
            "Code: 42501, Message: permission denied, Hint: check your policies"
        );
    }
}
