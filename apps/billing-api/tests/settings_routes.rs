use chrono::Utc;
use http::StatusCode;
use serde_json::{Value, json};

mod common;
use common::{
    bootstrap_admin, create_flat, set_tariff, setup_test_app, submit_reading, tenant_session,
};

#[tokio::test]
async fn test_default_settings() {
    let app = setup_test_app();
    let admin = bootstrap_admin(&app.server).await;

    let settings = app
        .server
        .get("/api/settings")
        .authorization_bearer(&admin)
        .await
        .json::<Value>();
    assert_eq!(settings["version"], 1);
    assert_eq!(settings["tariff_per_unit"].as_f64(), Some(0.0));
    assert_eq!(settings["minimum_price"].as_f64(), Some(250.0));
    assert_eq!(settings["unit_factor"].as_f64(), Some(2.3));
}

#[tokio::test]
async fn test_settings_update_is_admin_only_and_validated() {
    let app = setup_test_app();
    let admin = bootstrap_admin(&app.server).await;
    let flat_id = create_flat(&app.server, &admin, "A-101", None).await;
    let tenant = tenant_session(&app.server, &admin, "ravi", &flat_id).await;

    let response = app
        .server
        .put("/api/settings")
        .authorization_bearer(&tenant)
        .json(&json!({ "tariff_per_unit": 1 }))
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);

    let response = app
        .server
        .put("/api/settings")
        .authorization_bearer(&admin)
        .json(&json!({ "minimum_price": -1 }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let updated = set_tariff(&app.server, &admin, 8.0).await;
    assert_eq!(updated["version"], 2);
    assert_eq!(updated["tariff_per_unit"].as_f64(), Some(8.0));
    assert_eq!(updated["minimum_price"].as_f64(), Some(250.0));
}

#[tokio::test]
async fn test_monthly_summary() {
    let app = setup_test_app();
    let admin = bootstrap_admin(&app.server).await;
    set_tariff(&app.server, &admin, 7.5).await;

    let flat_a = create_flat(&app.server, &admin, "A-101", Some(100.0)).await;
    let flat_b = create_flat(&app.server, &admin, "B-202", Some(10.0)).await;
    let flat_c = create_flat(&app.server, &admin, "C-303", None).await;
    let ravi = tenant_session(&app.server, &admin, "ravi", &flat_a).await;
    let meera = tenant_session(&app.server, &admin, "meera", &flat_b).await;
    let arjun = tenant_session(&app.server, &admin, "arjun", &flat_c).await;

    let a = submit_reading(&app.server, &ravi, 150.0).await;
    let b = submit_reading(&app.server, &meera, 5.0).await;
    submit_reading(&app.server, &arjun, 1.0).await;

    for (reading, corrected) in [(&a, 150), (&b, 5)] {
        let response = app
            .server
            .post(&format!("/api/readings/{}/approve", reading["id"].as_str().unwrap()))
            .authorization_bearer(&admin)
            .json(&json!({ "corrected_reading": corrected }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    let month = Utc::now().format("%Y-%m").to_string();
    let response = app
        .server
        .get(&format!("/api/summaries/{}", month))
        .authorization_bearer(&admin)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let summary = response.json::<Value>();

    assert_eq!(summary["month"], month.as_str());
    assert_eq!(summary["approved_count"], 2);
    assert_eq!(summary["pending_count"], 1);
    assert_eq!(summary["rejected_count"], 0);
    let lines = summary["lines"].as_array().unwrap();
    assert_eq!(lines[0]["flat_number"], "A-101");
    assert_eq!(lines[0]["amount"].as_f64(), Some(1112.5));
    // Corrected below the previous reading: minimum price only.
    assert_eq!(lines[1]["units_used"].as_f64(), Some(0.0));
    assert_eq!(lines[1]["amount"].as_f64(), Some(250.0));
    assert_eq!(summary["total_amount"].as_f64(), Some(1362.5));

    let response = app
        .server
        .get(&format!("/api/summaries/{}", month))
        .authorization_bearer(&ravi)
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);

    let response = app
        .server
        .get("/api/summaries/2024-13")
        .authorization_bearer(&admin)
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health() {
    let app = setup_test_app();
    let response = app.server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["status"], "ok");
}
