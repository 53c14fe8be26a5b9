use std::str::FromStr;

use axum::response::Redirect;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::AppError;

/// Trims a form value; blank becomes `None`.
pub fn text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn required(field: &str, value: Option<String>) -> Result<String, AppError> {
    text(value).ok_or_else(|| AppError::bad_request(format!("{} is required", field)))
}

pub fn decimal(field: &str, value: Option<&str>) -> Result<Option<Decimal>, AppError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(raw) => Decimal::from_str(raw.trim_start_matches('$'))
            .map(Some)
            .map_err(|_| AppError::bad_request(format!("{} must be a number", field))),
        None => Ok(None),
    }
}

/// Non-negative amount in whole cents. Blank is zero.
pub fn money(field: &str, value: Option<&str>) -> Result<Decimal, AppError> {
    Ok(optional_money(field, value)?.unwrap_or(Decimal::ZERO))
}

pub fn optional_money(field: &str, value: Option<&str>) -> Result<Option<Decimal>, AppError> {
    let amount = match decimal(field, value)? {
        Some(amount) => amount,
        None => return Ok(None),
    };
    if amount < Decimal::ZERO {
        return Err(AppError::bad_request(format!("{} cannot be negative", field)));
    }
    // Stored as NUMERIC(12, 2); anything finer would be rounded away after
    // totals were already computed from it.
    if amount.normalize().scale() > 2 {
        return Err(AppError::bad_request(format!("{} cannot have more than 2 decimal places", field)));
    }
    Ok(Some(amount))
}

/// Largest quantity or count a single form line may carry.
pub const MAX_QUANTITY: i32 = 100_000;

pub fn quantity(field: &str, value: Option<&str>) -> Result<i32, AppError> {
    let raw = value.map(str::trim).unwrap_or_default();
    let qty = raw
        .parse::<i32>()
        .map_err(|_| AppError::bad_request(format!("{} must be a whole number", field)))?;
    if qty <= 0 {
        return Err(AppError::bad_request(format!("{} must be at least 1", field)));
    }
    if qty > MAX_QUANTITY {
        return Err(AppError::bad_request(format!("{} cannot be more than {}", field, MAX_QUANTITY)));
    }
    Ok(qty)
}

pub fn count(field: &str, value: Option<&str>) -> Result<i32, AppError> {
    let raw = value.map(str::trim).unwrap_or_default();
    let qty = raw
        .parse::<i32>()
        .map_err(|_| AppError::bad_request(format!("{} must be a whole number", field)))?;
    if qty < 0 {
        return Err(AppError::bad_request(format!("{} cannot be negative", field)));
    }
    if qty > MAX_QUANTITY {
        return Err(AppError::bad_request(format!("{} cannot be more than {}", field, MAX_QUANTITY)));
    }
    Ok(qty)
}

pub fn uuid(field: &str, value: Option<&str>) -> Result<Uuid, AppError> {
    optional_uuid(value).ok_or_else(|| AppError::bad_request(format!("{} is required", field)))
}

pub fn optional_uuid(value: Option<&str>) -> Option<Uuid> {
    value.and_then(|v| Uuid::parse_str(v.trim()).ok())
}

pub fn date(value: Option<&str>) -> Option<NaiveDate> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

/// Collects row indexes of a repeated-key form whose key column is filled in.
pub fn filled_rows(keys: &[String]) -> Vec<usize> {
    keys.iter()
        .enumerate()
        .filter(|(_, k)| !k.trim().is_empty())
        .map(|(i, _)| i)
        .collect()
}

pub fn cell(values: &[String], idx: usize) -> Option<&str> {
    values.get(idx).map(String::as_str)
}

pub fn redirect_with_notice(path: &str, notice: &str) -> Redirect {
    Redirect::to(&format!("{}?notice={}", path, urlencoding::encode(notice)))
}
