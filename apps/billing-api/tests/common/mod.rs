#![allow(dead_code)]

use axum_test::TestServer;
use billing_api::{AppState, create_app};
use http::StatusCode;
use serde_json::{Value, json};

pub const ADMIN_PASSWORD: &str = "admin-pass";
pub const TENANT_PASSWORD: &str = "tenant-pass";

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
}

pub fn setup_test_app() -> TestApp {
    let state = AppState::in_memory();
    let server = TestServer::new(create_app(state.clone())).expect("Failed to create TestServer");
    TestApp { server, state }
}

/// Registers the first admin through the open bootstrap path and logs in.
pub async fn bootstrap_admin(server: &TestServer) -> String {
    let response = server
        .post("/api/users")
        .json(&json!({
            "username": "admin",
            "password": ADMIN_PASSWORD,
            "role": "admin"
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    login(server, "admin", ADMIN_PASSWORD).await
}

pub async fn login(server: &TestServer, username: &str, password: &str) -> String {
    let response = server
        .post("/api/auth/login")
        .json(&json!({ "username": username, "password": password }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK, "login as {}", username);
    response.json::<Value>()["token"]
        .as_str()
        .expect("token should be a string")
        .to_string()
}

pub async fn create_flat(
    server: &TestServer,
    admin_token: &str,
    flat_number: &str,
    initial_reading: Option<f64>,
) -> String {
    let response = server
        .post("/api/flats")
        .authorization_bearer(admin_token)
        .json(&json!({
            "flat_number": flat_number,
            "tenant_name": format!("Tenant of {}", flat_number),
            "initial_reading": initial_reading
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    response.json::<Value>()["id"]
        .as_str()
        .expect("flat id should be a string")
        .to_string()
}

/// Creates a tenant linked to `flat_id` and returns their session token.
pub async fn tenant_session(
    server: &TestServer,
    admin_token: &str,
    username: &str,
    flat_id: &str,
) -> String {
    let response = server
        .post("/api/users")
        .authorization_bearer(admin_token)
        .json(&json!({
            "username": username,
            "password": TENANT_PASSWORD,
            "role": "tenant",
            "flat_id": flat_id
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    login(server, username, TENANT_PASSWORD).await
}

pub async fn submit_reading(server: &TestServer, token: &str, value: f64) -> Value {
    let response = server
        .post("/api/readings")
        .authorization_bearer(token)
        .json(&json!({ "image_ref": "uploads/meter.jpg", "tenant_reading": value }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    response.json::<Value>()
}

pub async fn set_tariff(server: &TestServer, admin_token: &str, tariff: f64) -> Value {
    let response = server
        .put("/api/settings")
        .authorization_bearer(admin_token)
        .json(&json!({ "tariff_per_unit": tariff }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    response.json::<Value>()
}
