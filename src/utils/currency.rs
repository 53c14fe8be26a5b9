use std::collections::HashMap;

use rust_decimal::{Decimal, RoundingStrategy};

/// Upper-cases and validates an ISO-style three letter currency code.
pub fn normalize_currency(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(code)
    } else {
        None
    }
}

/// Money amounts are kept at cent precision once converted.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Converts an amount in a foreign currency into the base currency.
pub fn convert(amount: Decimal, rate_to_base: Decimal) -> Decimal {
    round_money(amount * rate_to_base)
}

/// Rates keyed by currency code, each expressed as base units per foreign unit.
#[derive(Debug, Clone)]
pub struct RateTable {
    base: String,
    rates: HashMap<String, Decimal>,
}

impl RateTable {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            rates: HashMap::new(),
        }
    }

    pub fn from_rows(base: impl Into<String>, rows: impl IntoIterator<Item = (String, Decimal)>) -> Self {
        let mut table = Self::new(base);
        for (currency, rate) in rows {
            table.insert(&currency, rate);
        }
        table
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Ignores the base currency and non-positive rates.
    pub fn insert(&mut self, currency: &str, rate: Decimal) {
        if let Some(code) = normalize_currency(currency) {
            if code != self.base && rate > Decimal::ZERO {
                self.rates.insert(code, rate);
            }
        }
    }

    pub fn rate_for(&self, currency: &str) -> Option<Decimal> {
        let code = normalize_currency(currency)?;
        if code == self.base {
            return Some(Decimal::ONE);
        }
        self.rates.get(&code).copied()
    }

    /// Stored rates sorted by currency code.
    pub fn entries(&self) -> Vec<(&str, Decimal)> {
        let mut entries: Vec<_> = self.rates.iter().map(|(code, rate)| (code.as_str(), *rate)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn currency_codes_are_normalized() {
        assert_eq!(normalize_currency(" jpy"), Some("JPY".to_string()));
        assert_eq!(normalize_currency("US"), None);
        assert_eq!(normalize_currency("U$D"), None);
        assert_eq!(normalize_currency("EURO"), None);
    }

    #[test]
    fn conversion_rounds_half_away_from_zero() {
        assert_eq!(convert(d("1000"), d("0.0067")), d("6.70"));
        assert_eq!(convert(d("0.25"), d("0.5")), d("0.13"));
        assert_eq!(convert(d("-0.25"), d("0.5")), d("-0.13"));
    }

    #[test]
    fn base_currency_always_converts_one_to_one() {
        let table = RateTable::new("USD");
        assert_eq!(table.rate_for("usd"), Some(Decimal::ONE));
        assert_eq!(convert(d("12.345"), Decimal::ONE), d("12.35"));
    }

    #[test]
    fn unknown_currency_has_no_rate() {
        let table = RateTable::from_rows("USD", vec![("JPY".to_string(), d("0.0068"))]);
        assert_eq!(table.rate_for("EUR"), None);
        assert_eq!(table.rate_for("jpy"), Some(d("0.0068")));
    }

    #[test]
    fn base_and_invalid_rates_are_not_stored() {
        let mut table = RateTable::new("USD");
        table.insert("USD", d("2"));
        table.insert("CAD", d("0"));
        table.insert("GBP", d("-1"));
        assert_eq!(table.rate_for("USD"), Some(Decimal::ONE));
        assert_eq!(table.rate_for("CAD"), None);
        assert_eq!(table.rate_for("GBP"), None);
    }

    #[test]
    fn entries_are_sorted_by_code() {
        let table = RateTable::from_rows(
            "USD",
            vec![("JPY".to_string(), d("0.0068")), ("CAD".to_string(), d("0.74"))],
        );
        assert_eq!(table.entries(), vec![("CAD", d("0.74")), ("JPY", d("0.0068"))]);
        assert_eq!(table.base(), "USD");
    }
}
