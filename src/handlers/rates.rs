use axum::{
    extract::{Form, Query, State},
    response::{Html, Redirect},
};
use askama::Template;
use rust_decimal::Decimal;
use serde::Deserialize;
use tower_cookies::Cookies;

use crate::{
    database::AppState,
    error::AppError,
    middleware::{require_admin, CurrentUser},
    models::ExchangeRate,
    utils::{
        currency::normalize_currency,
        forms::{self, redirect_with_notice},
    },
};

use super::{render, Notice};

#[derive(Template)]
#[template(path = "rates.html")]
struct RatesTemplate {
    current_user: CurrentUser,
    base_currency: String,
    rates: Vec<ExchangeRate>,
    notice: String,
}

#[derive(Deserialize)]
pub struct RateForm {
    currency: String,
    rate_to_base: String,
}

impl RateForm {
    fn validate(&self, base_currency: &str) -> Result<(String, Decimal), AppError> {
        let currency = normalize_currency(&self.currency)
            .ok_or_else(|| AppError::bad_request("Currency must be a three letter code"))?;
        if currency == base_currency {
            return Err(AppError::bad_request(format!(
                "{} is the base currency and is always 1",
                base_currency
            )));
        }
        let rate = forms::decimal("Rate", Some(&self.rate_to_base))?
            .filter(|r| *r > Decimal::ZERO)
            .ok_or_else(|| AppError::bad_request("Rate must be greater than zero"))?;
        Ok((currency, rate))
    }
}

pub async fn rates_page(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(notice): Query<Notice>,
) -> Result<Html<String>, AppError> {
    let current_user = require_admin(&cookies, &state).await?;

    let rates = sqlx::query_as::<_, ExchangeRate>("SELECT * FROM exchange_rates ORDER BY currency")
        .fetch_all(&state.db)
        .await?;

    render(RatesTemplate {
        current_user,
        base_currency: state.config.base_currency.clone(),
        rates,
        notice: notice.notice,
    })
}

/// Adds a currency or replaces its rate. Past entries keep the rate they
/// were recorded with.
pub async fn save_rate(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<RateForm>,
) -> Result<Redirect, AppError> {
    let current_user = require_admin(&cookies, &state).await?;
    let (currency, rate) = form.validate(&state.config.base_currency)?;

    sqlx::query(
        r#"
        INSERT INTO exchange_rates (currency, rate_to_base, updated_by)
        VALUES ($1, $2, $3)
        ON CONFLICT (currency) DO UPDATE
        SET rate_to_base = EXCLUDED.rate_to_base, updated_by = EXCLUDED.updated_by, updated_at = NOW()
        "#,
    )
    .bind(&currency)
    .bind(rate)
    .bind(current_user.id)
    .execute(&state.db)
    .await?;

    log::info!("{} set {} rate to {}", current_user.display_name, currency, rate);
    Ok(redirect_with_notice("/rates", &format!("{} = {} {}", currency, rate, state.config.base_currency)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(currency: &str, rate: &str) -> RateForm {
        RateForm {
            currency: currency.into(),
            rate_to_base: rate.into(),
        }
    }

    #[test]
    fn valid_rate_is_normalized() {
        let (currency, rate) = form("cad", "0.7350").validate("USD").unwrap();
        assert_eq!(currency, "CAD");
        assert_eq!(rate.to_string(), "0.7350");
    }

    #[test]
    fn base_currency_cannot_be_stored() {
        assert!(form("usd", "1").validate("USD").is_err());
    }

    #[test]
    fn zero_and_blank_rates_are_rejected() {
        assert!(form("JPY", "0").validate("USD").is_err());
        assert!(form("JPY", "").validate("USD").is_err());
    }
}
