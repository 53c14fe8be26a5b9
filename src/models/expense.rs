use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct ExpenseCategory {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct Expense {
    pub id: Uuid,
    pub category_id: Uuid,
    pub vendor: Option<String>,
    pub description: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub exchange_rate: Decimal,
    pub amount_base: Decimal,
    pub expense_date: NaiveDate,
    pub receipt_url: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Expense {
    pub fn vendor_text(&self) -> &str {
        self.vendor.as_deref().unwrap_or("")
    }

    pub fn description_text(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct ExpenseDisplay {
    pub id: Uuid,
    pub category_name: String,
    pub vendor: String,
    pub description: String,
    pub amount: Decimal,
    pub currency: String,
    pub amount_base: Decimal,
    pub receipt_url: Option<String>,
    pub expense_date: NaiveDate,
    pub created_by: String,
}
