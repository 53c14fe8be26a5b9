use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::utils::{
    costing::{allocate, unit_cost},
    currency::convert,
};

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct Purchase {
    pub id: Uuid,
    pub supplier: String,
    pub order_date: NaiveDate,
    pub currency: String,
    pub exchange_rate: Decimal,
    pub location_id: Uuid,
    pub shipping_cost: Decimal,
    pub tax_cost: Decimal,
    pub other_cost: Decimal,
    pub status: String,
    pub notes: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub received_by: Option<Uuid>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Purchase {
    pub fn extra_costs(&self) -> Decimal {
        self.shipping_cost + self.tax_cost + self.other_cost
    }

    pub fn is_open(&self) -> bool {
        self.status == "ordered"
    }

    pub fn notes_text(&self) -> &str {
        self.notes.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct PurchaseItem {
    pub id: Uuid,
    pub purchase_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub landed_unit_cost: Option<Decimal>,
    pub line_no: i32,
}

#[derive(Debug, Serialize, FromRow)]
pub struct PurchaseItemDisplay {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub landed_unit_cost: String,
}

#[derive(Debug, Serialize, FromRow)]
pub struct PurchaseSummary {
    pub id: Uuid,
    pub supplier: String,
    pub order_date: NaiveDate,
    pub currency: String,
    pub location_name: String,
    pub status: String,
    pub line_count: i64,
    pub unit_count: i64,
    pub goods_total: Decimal,
}

/// Landed per-unit cost in base currency for each line.
///
/// Each line is converted at the order's rate, then carries a share of the
/// converted extra costs in proportion to its converted subtotal.
pub fn landed_unit_costs(
    lines: &[(i32, Decimal)],
    extra_costs: Decimal,
    exchange_rate: Decimal,
) -> Vec<Decimal> {
    let subtotals: Vec<Decimal> = lines
        .iter()
        .map(|(qty, price)| convert(Decimal::from(*qty) * *price, exchange_rate))
        .collect();
    let shares = allocate(convert(extra_costs, exchange_rate), &subtotals);

    lines
        .iter()
        .zip(subtotals.iter().zip(shares.iter()))
        .map(|((qty, _), (subtotal, share))| unit_cost(*subtotal + *share, *qty))
        .collect()
}
