use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::utils::costing::{allocate, round_cost};

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct GradingSubmission {
    pub id: Uuid,
    pub company: String,
    pub submission_number: Option<String>,
    pub service_level: Option<String>,
    pub status: String,
    pub shipping_cost: Decimal,
    pub submitted_on: NaiveDate,
    pub returned_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl GradingSubmission {
    pub fn submission_number_text(&self) -> &str {
        self.submission_number.as_deref().unwrap_or("")
    }

    pub fn service_level_text(&self) -> &str {
        self.service_level.as_deref().unwrap_or("")
    }

    pub fn notes_text(&self) -> &str {
        self.notes.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct GradingItem {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub product_id: Uuid,
    pub origin_location_id: Uuid,
    pub raw_cost: Decimal,
    pub grading_fee: Decimal,
    pub shipping_share: Decimal,
    pub declared_value: Option<Decimal>,
    pub grade: Option<String>,
    pub graded_product_id: Option<Uuid>,
    pub return_location_id: Option<Uuid>,
    pub returned_at: Option<DateTime<Utc>>,
    pub line_no: i32,
}

impl GradingItem {
    /// Cost basis of the slab that comes back.
    pub fn graded_cost(&self) -> Decimal {
        round_cost(self.raw_cost + self.grading_fee + self.shipping_share)
    }
}

#[derive(Debug, Serialize, FromRow)]
pub struct GradingItemDisplay {
    pub id: Uuid,
    pub product_name: String,
    pub origin_location: String,
    pub raw_cost: Decimal,
    pub grading_fee: Decimal,
    pub shipping_share: Decimal,
    pub declared_value: String,
    pub grade: String,
    pub graded_product: String,
    pub is_returned: bool,
}

impl GradingItemDisplay {
    pub fn graded_cost(&self) -> Decimal {
        round_cost(self.raw_cost + self.grading_fee + self.shipping_share)
    }
}

#[derive(Debug, Serialize, FromRow)]
pub struct GradingSummary {
    pub id: Uuid,
    pub company: String,
    pub submission_number: String,
    pub status: String,
    pub submitted_on: NaiveDate,
    pub item_count: i64,
    pub returned_count: i64,
    pub total_fees: Decimal,
}

/// Splits submission shipping evenly across its cards.
pub fn shipping_shares(shipping_cost: Decimal, items: usize) -> Vec<Decimal> {
    allocate(shipping_cost, &vec![Decimal::ONE; items])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn shipping_is_split_evenly_with_remainder_last() {
        let shares = shipping_shares(d("25"), 3);
        assert_eq!(shares, vec![d("8.3333"), d("8.3333"), d("8.3334")]);
        assert!(shipping_shares(d("25"), 0).is_empty());
    }

    #[test]
    fn graded_cost_adds_fee_and_shipping() {
        let item = GradingItem {
            id: Uuid::nil(),
            submission_id: Uuid::nil(),
            product_id: Uuid::nil(),
            origin_location_id: Uuid::nil(),
            raw_cost: d("40"),
            grading_fee: d("24.99"),
            shipping_share: d("8.3333"),
            declared_value: None,
            grade: None,
            graded_product_id: None,
            return_location_id: None,
            returned_at: None,
            line_no: 1,
        };
        assert_eq!(item.graded_cost(), d("73.3233"));
    }
}
