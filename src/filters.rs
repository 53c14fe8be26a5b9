use std::borrow::Borrow;

use askama::Result;
use rust_decimal::{Decimal, RoundingStrategy};

// Custom template filters, used as `{{ amount|money }}` etc.

/// Two decimal places with thousands separators, e.g. `1,234.50`.
#[allow(clippy::unnecessary_wraps)]
pub fn money<T: Borrow<Decimal>>(value: T) -> Result<String> {
    Ok(format_money(*value.borrow()))
}

/// Unit costs keep four places but drop trailing zeros past the cents.
#[allow(clippy::unnecessary_wraps)]
pub fn cost<T: Borrow<Decimal>>(value: T) -> Result<String> {
    let rounded = value
        .borrow()
        .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
        .normalize();
    if rounded.scale() <= 2 {
        Ok(format_money(rounded))
    } else {
        Ok(rounded.to_string())
    }
}

/// Explicit `+` on positive quantities.
#[allow(clippy::unnecessary_wraps)]
pub fn qty_sign<T: Borrow<i64>>(value: T) -> Result<String> {
    let v = *value.borrow();
    Ok(if v > 0 { format!("+{}", v) } else { v.to_string() })
}

fn format_money(value: Decimal) -> String {
    let rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let text = format!("{:.2}", rounded.abs());
    let (whole, cents) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, c) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    format!("{}{}.{}", if negative { "-" } else { "" }, grouped, cents)
}
