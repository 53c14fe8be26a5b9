use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::{database::Database, utils::currency::RateTable};

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct ExchangeRate {
    pub currency: String,
    pub rate_to_base: Decimal,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Option<Uuid>,
}

pub async fn load_rate_table(db: &Database, base_currency: &str) -> Result<RateTable, sqlx::Error> {
    let rows = sqlx::query_as::<_, (String, Decimal)>("SELECT currency, rate_to_base FROM exchange_rates")
        .fetch_all(db)
        .await?;
    Ok(RateTable::from_rows(base_currency, rows))
}
