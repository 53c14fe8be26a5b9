use axum::{
    extract::{Path, State},
    response::Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    database::AppState,
    error::AppError,
    middleware::require_user,
    models::{rate::load_rate_table, StockRow},
};

use super::inventory::stock_for_product;

#[derive(Debug, Serialize, PartialEq)]
pub struct LocationStock {
    pub location_id: Uuid,
    pub location_name: String,
    pub quantity: i32,
    pub average_cost: Decimal,
}

impl From<StockRow> for LocationStock {
    fn from(row: StockRow) -> Self {
        Self {
            location_id: row.location_id,
            location_name: row.location_name,
            quantity: row.quantity,
            average_cost: row.average_cost,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RateEntry {
    pub currency: String,
    pub rate_to_base: Decimal,
}

#[derive(Debug, Serialize)]
pub struct RatesResponse {
    pub base_currency: String,
    pub rates: Vec<RateEntry>,
}

/// Per-location stock for the sale and transfer forms.
pub async fn product_stock(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(product_id): Path<Uuid>,
) -> Result<Json<Vec<LocationStock>>, AppError> {
    require_user(&cookies, &state).await?;

    let stock = stock_for_product(&state, product_id)
        .await?
        .into_iter()
        .map(LocationStock::from)
        .collect();

    Ok(Json(stock))
}

pub async fn rates(
    State(state): State<AppState>,
    cookies: Cookies,
) -> Result<Json<RatesResponse>, AppError> {
    require_user(&cookies, &state).await?;

    let table = load_rate_table(&state.db, &state.config.base_currency).await?;
    let rates = table
        .entries()
        .into_iter()
        .map(|(currency, rate_to_base)| RateEntry {
            currency: currency.to_string(),
            rate_to_base,
        })
        .collect();

    Ok(Json(RatesResponse {
        base_currency: table.base().to_string(),
        rates,
    }))
}
