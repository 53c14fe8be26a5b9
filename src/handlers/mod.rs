pub mod api;
pub mod auth;
pub mod breaks;
pub mod expenses;
pub mod grading;
pub mod inventory;
pub mod locations;
pub mod products;
pub mod purchases;
pub mod rates;
pub mod reports;
pub mod sales;
pub mod streams;
pub mod users;

use axum::{
    extract::State,
    response::Html,
};
use askama::Template;
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::FromRow;
use tower_cookies::Cookies;

use crate::{
    database::{AppState, Database},
    error::AppError,
    filters,
    middleware::{require_user, CurrentUser},
    models::{Location, Product},
};

pub fn render<T: Template>(template: T) -> Result<Html<String>, AppError> {
    Ok(Html(template.render()?))
}

/// `?notice=` shown above list pages after a redirect.
#[derive(Deserialize, Default)]
pub struct Notice {
    #[serde(default)]
    pub notice: String,
}

pub async fn active_products(db: &Database) -> Result<Vec<Product>, AppError> {
    Ok(sqlx::query_as::<_, Product>("SELECT * FROM products WHERE is_active = true ORDER BY name, sku")
        .fetch_all(db)
        .await?)
}

pub async fn active_locations(db: &Database) -> Result<Vec<Location>, AppError> {
    Ok(sqlx::query_as::<_, Location>("SELECT * FROM locations WHERE is_active = true ORDER BY name")
        .fetch_all(db)
        .await?)
}

#[derive(Debug, Default, FromRow)]
struct DashboardCounts {
    product_count: i64,
    units_on_hand: i64,
    inventory_value: Decimal,
    open_purchases: i64,
    open_submissions: i64,
    open_streams: i64,
    sales_today: i64,
    net_today: Decimal,
}

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    current_user: CurrentUser,
    base_currency: String,
    product_count: i64,
    units_on_hand: i64,
    inventory_value: Decimal,
    open_purchases: i64,
    open_submissions: i64,
    open_streams: i64,
    sales_today: i64,
    net_today: Decimal,
}

pub async fn dashboard(
    cookies: Cookies,
    State(state): State<AppState>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let counts = sqlx::query_as::<_, DashboardCounts>(
        r#"
        SELECT
            (SELECT COUNT(*) FROM products WHERE is_active = true) AS product_count,
            (SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM stock_levels) AS units_on_hand,
            (SELECT COALESCE(SUM(quantity * average_cost), 0) FROM stock_levels) AS inventory_value,
            (SELECT COUNT(*) FROM purchases WHERE status = 'ordered') AS open_purchases,
            (SELECT COUNT(*) FROM grading_submissions WHERE status = 'submitted') AS open_submissions,
            (SELECT COUNT(*) FROM streams WHERE status <> 'reconciled') AS open_streams,
            (SELECT COUNT(*) FROM sales WHERE status = 'completed' AND sold_at::date = CURRENT_DATE) AS sales_today,
            (SELECT COALESCE(SUM(net_base), 0) FROM sales WHERE status = 'completed' AND sold_at::date = CURRENT_DATE) AS net_today
        "#,
    )
    .fetch_one(&state.db)
    .await?;

    render(DashboardTemplate {
        current_user,
        base_currency: state.config.base_currency.clone(),
        product_count: counts.product_count,
        units_on_hand: counts.units_on_hand,
        inventory_value: counts.inventory_value,
        open_purchases: counts.open_purchases,
        open_submissions: counts.open_submissions,
        open_streams: counts.open_streams,
        sales_today: counts.sales_today,
        net_today: counts.net_today,
    })
}
