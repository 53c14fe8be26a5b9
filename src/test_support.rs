//! Fixtures for tests that run against a migrated database.

use std::{path::PathBuf, sync::Arc};

use axum::{
    body::Body,
    http::{header, Request},
    response::Response,
};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    database::AppState,
    middleware::AUTH_COOKIE,
    models::MovementType,
    stock::{self, Movement},
    utils::{create_token, hash_pin},
};

pub const PIN: &str = "2468";
pub const MAX_PIN_ATTEMPTS: i32 = 5;

pub fn state(db: PgPool) -> AppState {
    let config = AppConfig {
        database_url: String::new(),
        database_max_connections: 5,
        port: 0,
        jwt_secret: "test-secret".into(),
        base_currency: "USD".into(),
        session_hours: 12,
        max_pin_attempts: MAX_PIN_ATTEMPTS,
        receipts_dir: std::env::temp_dir().join(format!("receipts-{}", Uuid::new_v4())),
        bootstrap_admin: None,
    };
    AppState {
        db,
        config: Arc::new(config),
    }
}

pub async fn user(db: &PgPool, name: &str, role: &str) -> Uuid {
    sqlx::query_scalar::<_, Uuid>("INSERT INTO users (display_name, pin_hash, role) VALUES ($1, $2, $3) RETURNING id")
        .bind(name)
        .bind(hash_pin(PIN).unwrap())
        .bind(role)
        .fetch_one(db)
        .await
        .unwrap()
}

pub async fn product(db: &PgPool, sku: &str, name: &str) -> Uuid {
    sqlx::query_scalar::<_, Uuid>("INSERT INTO products (sku, name, product_type) VALUES ($1, $2, 'sealed') RETURNING id")
        .bind(sku)
        .bind(name)
        .fetch_one(db)
        .await
        .unwrap()
}

pub async fn location(db: &PgPool, name: &str) -> Uuid {
    sqlx::query_scalar::<_, Uuid>("INSERT INTO locations (name) VALUES ($1) RETURNING id")
        .bind(name)
        .fetch_one(db)
        .await
        .unwrap()
}

/// Puts `quantity` units on the shelf at `unit_cost` through the ledger.
pub async fn stock_up(db: &PgPool, user_id: Uuid, product_id: Uuid, location_id: Uuid, quantity: i32, unit_cost: &str) {
    let mut tx = db.begin().await.unwrap();
    stock::receive(
        &mut tx,
        product_id,
        location_id,
        quantity,
        dec(unit_cost),
        Movement::new(MovementType::Receipt, user_id),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
}

pub async fn level(db: &PgPool, product_id: Uuid, location_id: Uuid) -> stock::Level {
    let mut conn = db.acquire().await.unwrap();
    stock::current(&mut conn, product_id, location_id).await.unwrap()
}

pub async fn movements(db: &PgPool, movement_type: &str) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stock_movements WHERE movement_type = $1")
        .bind(movement_type)
        .fetch_one(db)
        .await
        .unwrap()
}

pub fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

pub fn session(state: &AppState, user_id: Uuid) -> String {
    let token = create_token(user_id, "tester".into(), "staff".into(), &state.config.jwt_secret, 1).unwrap();
    format!("{}={}", AUTH_COOKIE, token)
}

/// URL-encodes `pairs` as a form body. Keys may repeat.
pub fn form(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

pub async fn post(state: &AppState, cookie: Option<&str>, uri: &str, body: String) -> Response {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    crate::create_router(state.clone())
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap()
}
