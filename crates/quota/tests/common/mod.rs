#![allow(dead_code)]

use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;

use quota::orders::{ActorRole, Channel};
use quota::{
    AppState, CreateOrderRequest, Database, DatabaseConfig, Dealer, OrderLineRequest, Product,
    StaticDirectory,
};

pub const PRODUCT_A: i64 = 100;
pub const PRODUCT_B: i64 = 200;
pub const NORTH_DEALER: i64 = 1;
pub const SOUTH_DEALER: i64 = 2;

pub fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
}

pub fn directory() -> StaticDirectory {
    StaticDirectory::new()
        .with_territory("East")
        .with_dealer(Dealer {
            id: NORTH_DEALER,
            name: "Northern Hardware".into(),
            territory: "North".into(),
            address: Some("12 Station Road".into()),
            phone: None,
        })
        .with_dealer(Dealer {
            id: SOUTH_DEALER,
            name: "Southern Depot".into(),
            territory: "South".into(),
            address: None,
            phone: Some("555-0102".into()),
        })
        .with_product(Product {
            id: PRODUCT_A,
            name: "Cement 50kg".into(),
            unit: Some("bag".into()),
        })
        .with_product(Product {
            id: PRODUCT_B,
            name: "Rebar 12mm".into(),
            unit: Some("rod".into()),
        })
}

/// Fresh in-memory ledger with the schema in place
pub async fn state() -> AppState {
    let db = Database::new(&DatabaseConfig::new("sqlite::memory:"))
        .await
        .expect("connect to in-memory sqlite");
    db.create_schema().await.expect("create schema");
    AppState::new(Arc::new(db), Arc::new(directory()), Duration::from_secs(10))
}

pub fn order(dealer_id: i64, territory: &str, lines: &[(i64, i64)]) -> CreateOrderRequest {
    CreateOrderRequest {
        date: day(),
        territory: territory.to_string(),
        dealer_id,
        lines: lines
            .iter()
            .map(|&(product_id, quantity)| OrderLineRequest {
                product_id,
                quantity,
            })
            .collect(),
        created_by: "tso-1".to_string(),
        actor_role: ActorRole::Tso,
        channel: Channel::Web,
        request_key: None,
    }
}
