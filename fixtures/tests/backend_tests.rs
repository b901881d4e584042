use std::time::Duration;

use fixtures::{spawn_backend, Backend};
use serde_json::{json, Value};

async fn start() -> (Backend, String, reqwest::Client) {
    let backend = Backend::new();
    let base = spawn_backend(&backend).await.unwrap();
    let client = reqwest::Client::builder()
        .cookie_store(true)
        .build()
        .unwrap();
    (backend, base, client)
}

async fn login(client: &reqwest::Client, base: &str) -> Value {
    client
        .post(format!("{base}/auth/login"))
        .json(&json!({"email": "admin@example.com", "password": "admin123"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_login_issues_token_pair() {
    let (_backend, base, client) = start().await;

    let tokens = login(&client, &base).await;

    assert!(tokens["accessToken"].as_str().is_some());
    assert!(tokens["refreshToken"].as_str().is_some());
    assert_eq!(tokens["user"]["role"], "admin");
}

#[tokio::test]
async fn test_wrong_password_is_401() {
    let (_backend, base, client) = start().await;

    let response = client
        .post(format!("{base}/auth/login"))
        .json(&json!({"email": "admin@example.com", "password": "nope"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_protected_routes_need_a_live_token() {
    let (backend, base, client) = start().await;
    let tokens = login(&client, &base).await;
    let access = tokens["accessToken"].as_str().unwrap();

    let anonymous = client.get(format!("{base}/clientes")).send().await.unwrap();
    assert_eq!(anonymous.status(), reqwest::StatusCode::UNAUTHORIZED);

    let ok = client
        .get(format!("{base}/clientes"))
        .bearer_auth(access)
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), reqwest::StatusCode::OK);

    backend.revoke_access_tokens();
    let revoked = client
        .get(format!("{base}/clientes"))
        .bearer_auth(access)
        .send()
        .await
        .unwrap();
    assert_eq!(revoked.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_mutations_need_csrf_header_and_cookie() {
    let (backend, base, client) = start().await;
    let tokens = login(&client, &base).await;
    let access = tokens["accessToken"].as_str().unwrap();

    let rejected = client
        .post(format!("{base}/clientes"))
        .bearer_auth(access)
        .json(&json!({"nome": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), reqwest::StatusCode::FORBIDDEN);
    let body: Value = rejected.json().await.unwrap();
    assert_eq!(body["error"], "invalid csrf token");

    let csrf: Value = client
        .get(format!("{base}/api/csrf-token"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let csrf = csrf["csrfToken"].as_str().unwrap();

    let created = client
        .post(format!("{base}/clientes"))
        .bearer_auth(access)
        .header("x-csrf-token", csrf)
        .json(&json!({"nome": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), reqwest::StatusCode::CREATED);
    assert_eq!(backend.csrf_fetches(), 1);
}

#[tokio::test]
async fn test_refresh_exchanges_refresh_token() {
    let (backend, base, client) = start().await;
    let tokens = login(&client, &base).await;

    let refreshed = client
        .post(format!("{base}/auth/refresh"))
        .json(&json!({"refreshToken": tokens["refreshToken"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(refreshed.status(), reqwest::StatusCode::OK);
    let body: Value = refreshed.json().await.unwrap();
    assert_ne!(body["accessToken"], tokens["accessToken"]);

    let bogus = client
        .post(format!("{base}/auth/refresh"))
        .json(&json!({"refreshToken": "bogus"}))
        .send()
        .await
        .unwrap();
    assert_eq!(bogus.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(backend.refresh_calls(), 2);
}

#[tokio::test]
async fn test_status_route_answers_requested_code() {
    let (_backend, base, client) = start().await;
    let tokens = login(&client, &base).await;
    let access = tokens["accessToken"].as_str().unwrap();

    let response = client
        .get(format!("{base}/clientes/status/429"))
        .bearer_auth(access)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "30");
}

#[tokio::test]
async fn test_request_log_records_headers() {
    let (backend, base, client) = start().await;
    let tokens = login(&client, &base).await;
    let access = tokens["accessToken"].as_str().unwrap();

    client
        .get(format!("{base}/backup"))
        .bearer_auth(access)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .unwrap();

    let logged = backend.requests_to("/backup");
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].bearer(), Some(access));
    assert_eq!(logged[0].csrf, None);
}
