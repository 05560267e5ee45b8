use domicare_auth::{Auth, AuthOptions};
use reqwest::Client;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn session_json(access_token: &str, refresh_token: &str) -> serde_json::Value {
    json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "expires_in": 3600,
        "token_type": "bearer",
        "user": {
            "id": "6f1b8f5e-35f4-4f3c-9f3a-0a4b3f1a2c3d",
            "email": "aidant@example.com",
            "phone": null
        }
    })
}

fn new_auth(server: &MockServer) -> Auth {
    Auth::new(
        &server.uri(),
        "test_anon_key",
        Client::new(),
        AuthOptions::default(),
    )
}

#[tokio::test]
async fn test_sign_up() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/signup"))
        .respond_with(ResponseTemplate::new(200).set_body_json(session_json("tok", "ref")))
        .mount(&mock_server)
        .await;

    let auth = new_auth(&mock_server);

    let result = auth.sign_up("aidant@example.com", "password123").await;

    assert!(result.is_ok());
    let session = result.unwrap();
    assert_eq!(session.access_token, "tok");
    assert_eq!(session.user.email, Some("aidant@example.com".to_string()));
}

#[tokio::test]
async fn test_sign_in_rejected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })),
        )
        .mount(&mock_server)
        .await;

    let auth = new_auth(&mock_server);

    let result = auth
        .sign_in_with_password("aidant@example.com", "wrong")
        .await;

    assert!(result.is_err());
    // A rejected credential is not a "session missing" condition
    assert!(!result.unwrap_err().is_session_missing());
    assert!(auth.get_session().is_none());
}

#[tokio::test]
async fn test_refresh_session_replaces_tokens() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(session_json("tok-2", "ref-2")))
        .mount(&mock_server)
        .await;

    let auth = new_auth(&mock_server);

    // Seed the cache through the normal sign-in path
    auth.sign_in_with_password("aidant@example.com", "password123")
        .await
        .unwrap();

    let refreshed = auth.refresh_session().await.unwrap();
    assert_eq!(refreshed.access_token, "tok-2");
    assert_eq!(refreshed.refresh_token, "ref-2");

    let cached = auth.get_session().unwrap();
    assert_eq!(cached.access_token, "tok-2");
}

#[tokio::test]
async fn test_sign_out_clears_session() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(session_json("tok", "ref")))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/logout"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&mock_server)
        .await;

    let auth = new_auth(&mock_server);

    auth.sign_in_with_password("aidant@example.com", "password123")
        .await
        .unwrap();
    assert!(auth.get_session().is_some());

    auth.sign_out().await.unwrap();
    assert!(auth.get_session().is_none());
}

#[tokio::test]
async fn test_refresh_without_session() {
    let mock_server = MockServer::start().await;
    let auth = new_auth(&mock_server);

    let err = auth.refresh_session().await.unwrap_err();
    assert!(err.is_session_missing());
}
