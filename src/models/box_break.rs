use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::utils::costing::{allocate, unit_cost};

#[derive(Debug, Serialize, FromRow)]
pub struct BoxBreakSummary {
    pub id: Uuid,
    pub product_name: String,
    pub location_name: String,
    pub quantity: i32,
    pub total_cost: Decimal,
    pub output_units: i64,
    pub broken_by: String,
    pub broken_at: DateTime<Utc>,
}

impl BoxBreakSummary {
    pub fn broken_at_text(&self) -> String {
        self.broken_at.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[derive(Debug, Serialize, FromRow)]
pub struct BoxBreakOutputDisplay {
    pub product_id: Uuid,
    pub product_name: String,
    pub sku: String,
    pub quantity: i32,
    pub unit_value: String,
    pub allocated_unit_cost: Decimal,
}

/// One output line of a break as entered on the form.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakOutput {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_value: Option<Decimal>,
}

/// Per-unit cost for each output of a break costing `total_cost`.
///
/// Weighted by `quantity × unit_value` when every output has a positive
/// value, otherwise by quantity alone.
pub fn allocate_break_cost(total_cost: Decimal, outputs: &[BreakOutput]) -> Vec<Decimal> {
    let valued = !outputs.is_empty()
        && outputs
            .iter()
            .all(|o| o.unit_value.map_or(false, |v| v > Decimal::ZERO));

    let weights: Vec<Decimal> = outputs
        .iter()
        .map(|o| {
            let qty = Decimal::from(o.quantity);
            match (valued, o.unit_value) {
                (true, Some(value)) => qty * value,
                _ => qty,
            }
        })
        .collect();

    allocate(total_cost, &weights)
        .into_iter()
        .zip(outputs.iter())
        .map(|(share, o)| unit_cost(share, o.quantity))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn output(quantity: i32, value: Option<&str>) -> BreakOutput {
        BreakOutput {
            product_id: Uuid::new_v4(),
            quantity,
            unit_value: value.map(d),
        }
    }

    #[test]
    fn booster_box_into_packs_splits_by_count() {
        // 120.00 box into 36 packs.
        let costs = allocate_break_cost(d("120"), &[output(36, None)]);
        assert_eq!(costs, vec![d("3.3333")]);
    }

    #[test]
    fn valued_outputs_split_by_market_value() {
        // Packs worth 4.00 each and a promo worth 20.00.
        let costs = allocate_break_cost(d("100"), &[output(20, Some("4")), output(1, Some("20"))]);
        assert_eq!(costs, vec![d("4"), d("20")]);
    }

    #[test]
    fn any_missing_value_falls_back_to_counts() {
        let costs = allocate_break_cost(d("90"), &[output(8, Some("4")), output(1, None)]);
        assert_eq!(costs, vec![d("10"), d("10")]);
    }

    #[test]
    fn zero_cost_box_gives_zero_cost_outputs() {
        let costs = allocate_break_cost(Decimal::ZERO, &[output(10, None), output(2, None)]);
        assert_eq!(costs, vec![Decimal::ZERO, Decimal::ZERO]);
    }
}
