mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::*;
use quota::handlers::router;

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn app() -> Router {
    router(state().await)
}

#[tokio::test]
async fn test_health() {
    let app = app().await;
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_order_flow_over_http() {
    let app = app().await;

    let (status, quota) = call(
        &app,
        Method::PUT,
        "/quotas",
        Some(json!({
            "date": "2024-01-10",
            "product_id": PRODUCT_A,
            "territory": "North",
            "max_quantity": 5
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(quota["remaining_quantity"], 5);

    let new_order = |quantity: i64| {
        json!({
            "date": "2024-01-10",
            "territory": "North",
            "dealer_id": NORTH_DEALER,
            "created_by": "tso-1",
            "lines": [{ "product_id": PRODUCT_A, "quantity": quantity }]
        })
    };

    let (status, created) = call(&app, Method::POST, "/orders", Some(new_order(3))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["replayed"], false);
    let order_id = created["order_id"].as_str().unwrap().to_string();

    let (status, rejected) = call(&app, Method::POST, "/orders", Some(new_order(5))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(rejected["code"], "INSUFFICIENT_QUOTA");
    assert_eq!(rejected["details"]["remaining"], 2);
    assert_eq!(rejected["details"]["requested"], 5);

    let (status, view) = call(&app, Method::GET, &format!("/orders/{}", order_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["dealer_name"], "Northern Hardware");
    assert_eq!(view["actor_role"], "TSO");
    assert_eq!(view["channel"], "WEB");
    assert_eq!(view["lines"][0]["quantity"], 3);

    let (status, listed) =
        call(&app, Method::GET, "/orders?date=2024-01-10&dealer_id=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, deleted) =
        call(&app, Method::DELETE, &format!("/orders/{}", order_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["restored"][0]["quantity"], 3);

    let (status, quotas) =
        call(&app, Method::GET, "/quotas?date=2024-01-10&territory=North", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(quotas[0]["sold_quantity"], 0);
    assert_eq!(quotas[0]["remaining_quantity"], 5);

    let (status, missing) =
        call(&app, Method::GET, &format!("/orders/{}", order_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(missing["code"], "ORDER_NOT_FOUND");
}

#[tokio::test]
async fn test_replayed_request_key_returns_ok() {
    let app = app().await;
    call(
        &app,
        Method::PUT,
        "/quotas",
        Some(json!({
            "date": "2024-01-10",
            "product_id": PRODUCT_B,
            "territory": "South",
            "max_quantity": 8
        })),
    )
    .await;

    let body = json!({
        "date": "2024-01-10",
        "territory": "South",
        "dealer_id": SOUTH_DEALER,
        "created_by": "tso-2",
        "actor_role": "DEALER",
        "channel": "MOBILE",
        "request_key": "tab-3/0042",
        "lines": [{ "product_id": PRODUCT_B, "quantity": 2 }]
    });

    let (first_status, first) = call(&app, Method::POST, "/orders", Some(body.clone())).await;
    let (second_status, second) = call(&app, Method::POST, "/orders", Some(body)).await;
    assert_eq!(first_status, StatusCode::CREATED);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(second["replayed"], true);
    assert_eq!(first["order_id"], second["order_id"]);

    let (_, summary) = call(&app, Method::GET, "/quotas/summary?date=2024-01-10", None).await;
    assert_eq!(summary[0]["product_id"], PRODUCT_B);
    assert_eq!(summary[0]["sold_quantity"], 2);
}

#[tokio::test]
async fn test_validation_errors() {
    let app = app().await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/orders",
        Some(json!({
            "date": "2024-01-10",
            "territory": "South",
            "dealer_id": NORTH_DEALER,
            "created_by": "tso-1",
            "lines": [{ "product_id": PRODUCT_A, "quantity": 1 }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "TERRITORY_MISMATCH");
    assert_eq!(body["details"]["dealer_territory"], "North");

    let (status, body) = call(
        &app,
        Method::POST,
        "/orders",
        Some(json!({
            "date": "2024-01-10",
            "territory": "North",
            "dealer_id": NORTH_DEALER,
            "created_by": "tso-1",
            "lines": [{ "product_id": PRODUCT_A, "quantity": 0 }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_QUANTITY");

    let (status, body) = call(
        &app,
        Method::PUT,
        "/quotas",
        Some(json!({
            "date": "2024-01-10",
            "product_id": PRODUCT_A,
            "territory": "Atlantis",
            "max_quantity": 5
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "UNKNOWN_TERRITORY");
}

#[tokio::test]
async fn test_bulk_and_remove_quota() {
    let app = app().await;

    let (status, bulk) = call(
        &app,
        Method::POST,
        "/quotas/bulk",
        Some(json!({
            "date": "2024-01-10",
            "allocations": [
                { "product_id": PRODUCT_A, "territory": "North", "max_quantity": 10 },
                { "product_id": PRODUCT_A, "territory": "South", "max_quantity": 20 },
                { "product_id": PRODUCT_A, "territory": "North", "max_quantity": -1 }
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bulk["succeeded"], 2);
    assert_eq!(bulk["failed"], 1);
    assert_eq!(bulk["results"][1]["quota"]["max_quantity"], 20);
    assert_eq!(bulk["results"][2]["error"]["code"], "INVALID_QUANTITY");

    let (status, removed) = call(
        &app,
        Method::DELETE,
        &format!("/quotas/2024-01-10/{}/South", PRODUCT_A),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(removed["territory"], "South");

    let (status, missing) = call(
        &app,
        Method::DELETE,
        &format!("/quotas/2024-01-10/{}/South", PRODUCT_A),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(missing["code"], "QUOTA_NOT_FOUND");

    let (_, quotas) = call(&app, Method::GET, "/quotas?date=2024-01-10", None).await;
    assert_eq!(quotas.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_malformed_requests_use_error_body() {
    let app = app().await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/orders",
        Some(json!({
            "date": "2024-01-10",
            "territory": "North",
            "dealer_id": NORTH_DEALER,
            "created_by": "tso-1",
            "lines": [{ "product_id": PRODUCT_A, "quantity": "x" }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
    assert!(body["message"].as_str().unwrap().contains("quantity"));

    let (status, body) = call(&app, Method::GET, "/quotas", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, body) = call(&app, Method::GET, "/quotas/summary", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, body) = call(&app, Method::DELETE, "/quotas/2024-01-10/abc/North", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
}
