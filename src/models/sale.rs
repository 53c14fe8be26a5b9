use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::utils::{costing::round_cost, currency::convert};

pub const SALE_CHANNELS: [&str; 5] = ["storefront", "ebay", "tcgplayer", "whatnot", "other"];

pub fn is_sale_channel(channel: &str) -> bool {
    SALE_CHANNELS.contains(&channel)
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct Sale {
    pub id: Uuid,
    pub channel: String,
    pub stream_id: Option<Uuid>,
    pub buyer: Option<String>,
    pub currency: String,
    pub exchange_rate: Decimal,
    pub subtotal: Decimal,
    pub shipping_charged: Decimal,
    pub platform_fees: Decimal,
    pub shipping_cost: Decimal,
    pub gross_base: Decimal,
    pub net_base: Decimal,
    pub cogs: Decimal,
    pub status: String,
    pub notes: Option<String>,
    pub sold_at: DateTime<Utc>,
    pub recorded_by: Option<Uuid>,
    pub voided_at: Option<DateTime<Utc>>,
    pub voided_by: Option<Uuid>,
}

impl Sale {
    pub fn profit(&self) -> Decimal {
        self.net_base - self.cogs
    }

    pub fn is_voided(&self) -> bool {
        self.status == "voided"
    }

    pub fn buyer_text(&self) -> &str {
        self.buyer.as_deref().unwrap_or("")
    }

    pub fn notes_text(&self) -> &str {
        self.notes.as_deref().unwrap_or("")
    }

    pub fn sold_at_text(&self) -> String {
        self.sold_at.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct SaleItem {
    pub id: Uuid,
    pub sale_id: Uuid,
    pub product_id: Uuid,
    pub location_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub unit_cost: Decimal,
    pub line_no: i32,
}

#[derive(Debug, Serialize, FromRow)]
pub struct SaleItemDisplay {
    pub product_name: String,
    pub sku: String,
    pub location_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub unit_cost: Decimal,
}

#[derive(Debug, Serialize, FromRow)]
pub struct SaleSummary {
    pub id: Uuid,
    pub channel: String,
    pub buyer: String,
    pub currency: String,
    pub gross_base: Decimal,
    pub net_base: Decimal,
    pub cogs: Decimal,
    pub status: String,
    pub item_count: i64,
    pub sold_at: DateTime<Utc>,
}

impl SaleSummary {
    pub fn profit(&self) -> Decimal {
        self.net_base - self.cogs
    }

    pub fn sold_at_text(&self) -> String {
        self.sold_at.format("%Y-%m-%d %H:%M").to_string()
    }
}

/// A sale line once its cost basis is known.
#[derive(Debug, Clone, Copy)]
pub struct PricedLine {
    pub quantity: i32,
    pub unit_price: Decimal,
    pub unit_cost: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaleTotals {
    pub subtotal: Decimal,
    pub gross_base: Decimal,
    pub net_base: Decimal,
    pub cogs: Decimal,
}

impl SaleTotals {
    /// Prices, fees and shipping are in the sale currency; cost is already
    /// in base currency.
    pub fn compute(
        lines: &[PricedLine],
        shipping_charged: Decimal,
        platform_fees: Decimal,
        shipping_cost: Decimal,
        exchange_rate: Decimal,
    ) -> Self {
        let subtotal: Decimal = lines
            .iter()
            .map(|l| Decimal::from(l.quantity) * l.unit_price)
            .sum();
        let gross = subtotal + shipping_charged;
        let net = gross - platform_fees - shipping_cost;
        let cogs: Decimal = lines
            .iter()
            .map(|l| Decimal::from(l.quantity) * l.unit_cost)
            .sum();

        Self {
            subtotal,
            gross_base: convert(gross, exchange_rate),
            net_base: convert(net, exchange_rate),
            cogs: round_cost(cogs),
        }
    }

    pub fn profit(&self) -> Decimal {
        self.net_base - self.cogs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn line(quantity: i32, price: &str, cost: &str) -> PricedLine {
        PricedLine {
            quantity,
            unit_price: d(price),
            unit_cost: d(cost),
        }
    }

    #[test]
    fn storefront_sale_has_no_fees() {
        let totals = SaleTotals::compute(
            &[line(2, "5", "3.25"), line(1, "40", "22")],
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ONE,
        );
        assert_eq!(totals.subtotal, d("50"));
        assert_eq!(totals.gross_base, d("50"));
        assert_eq!(totals.net_base, d("50"));
        assert_eq!(totals.cogs, d("28.5"));
        assert_eq!(totals.profit(), d("21.5"));
    }

    #[test]
    fn platform_sale_nets_out_fees_and_postage() {
        // eBay: 100.00 + 5.00 shipping, 13.91 fees, 4.63 label.
        let totals = SaleTotals::compute(&[line(1, "100", "60")], d("5"), d("13.91"), d("4.63"), Decimal::ONE);
        assert_eq!(totals.gross_base, d("105"));
        assert_eq!(totals.net_base, d("86.46"));
        assert_eq!(totals.profit(), d("26.46"));
    }

    #[test]
    fn foreign_sale_converts_revenue_not_cost() {
        let totals = SaleTotals::compute(&[line(1, "100", "50")], Decimal::ZERO, d("10"), Decimal::ZERO, d("0.74"));
        assert_eq!(totals.gross_base, d("74"));
        assert_eq!(totals.net_base, d("66.6"));
        assert_eq!(totals.cogs, d("50"));
    }

    #[test]
    fn channels_are_validated() {
        assert!(is_sale_channel("tcgplayer"));
        assert!(!is_sale_channel("craigslist"));
    }
}
