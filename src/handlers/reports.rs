use axum::{
    extract::{Query, State},
    response::Html,
};
use askama::Template;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::FromRow;
use tower_cookies::Cookies;

use crate::{
    database::AppState,
    error::AppError,
    filters,
    middleware::{require_admin, CurrentUser},
    utils::forms,
};

use super::render;

#[derive(Deserialize)]
pub struct ReportFilters {
    date_from: Option<String>,
    date_to: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ChannelRow {
    pub channel: String,
    pub sale_count: i64,
    pub gross: Decimal,
    pub fees: Decimal,
    pub net: Decimal,
    pub cogs: Decimal,
}

impl ChannelRow {
    pub fn profit(&self) -> Decimal {
        self.net - self.cogs
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CategoryRow {
    pub category: String,
    pub expense_count: i64,
    pub total: Decimal,
}

#[derive(Debug, Clone, FromRow)]
pub struct ValuationRow {
    pub location: String,
    pub units: i64,
    pub value: Decimal,
}

/// Bottom line for the period.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub sale_count: i64,
    pub gross: Decimal,
    pub net: Decimal,
    pub cogs: Decimal,
    pub sales_profit: Decimal,
    pub expenses: Decimal,
    pub net_profit: Decimal,
    pub inventory_value: Decimal,
}

impl ReportSummary {
    pub fn build(channels: &[ChannelRow], categories: &[CategoryRow], valuation: &[ValuationRow]) -> Self {
        let mut summary = Self::default();
        for row in channels {
            summary.sale_count += row.sale_count;
            summary.gross += row.gross;
            summary.net += row.net;
            summary.cogs += row.cogs;
        }
        summary.sales_profit = summary.net - summary.cogs;
        summary.expenses = categories.iter().map(|c| c.total).sum();
        summary.net_profit = summary.sales_profit - summary.expenses;
        summary.inventory_value = valuation.iter().map(|v| v.value).sum();
        summary
    }
}

/// Defaults to month to date.
fn report_range(from: Option<NaiveDate>, to: Option<NaiveDate>, today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let to = to.unwrap_or(today);
    let from = from.unwrap_or_else(|| today.with_day(1).unwrap_or(today));
    if from > to {
        (to, from)
    } else {
        (from, to)
    }
}

#[derive(Template)]
#[template(path = "reports.html")]
struct ReportsTemplate {
    current_user: CurrentUser,
    date_from: String,
    date_to: String,
    base_currency: String,
    channels: Vec<ChannelRow>,
    categories: Vec<CategoryRow>,
    valuation: Vec<ValuationRow>,
    summary: ReportSummary,
}

pub async fn reports_page(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(filters): Query<ReportFilters>,
) -> Result<Html<String>, AppError> {
    let current_user = require_admin(&cookies, &state).await?;

    let (from, to) = report_range(
        forms::date(filters.date_from.as_deref()),
        forms::date(filters.date_to.as_deref()),
        Utc::now().date_naive(),
    );
    // Sales are timestamped; compare against the day after the range end.
    let until = to + Duration::days(1);

    let channels = sqlx::query_as::<_, ChannelRow>(
        r#"
        SELECT
            channel,
            COUNT(*) AS sale_count,
            COALESCE(SUM(gross_base), 0) AS gross,
            COALESCE(SUM(ROUND(platform_fees * exchange_rate, 2)), 0) AS fees,
            COALESCE(SUM(net_base), 0) AS net,
            COALESCE(SUM(cogs), 0) AS cogs
        FROM sales
        WHERE status = 'completed' AND sold_at >= $1 AND sold_at < $2
        GROUP BY channel
        ORDER BY channel
        "#,
    )
    .bind(from)
    .bind(until)
    .fetch_all(&state.db)
    .await?;

    let categories = sqlx::query_as::<_, CategoryRow>(
        r#"
        SELECT
            ec.name AS category,
            COUNT(e.id) AS expense_count,
            COALESCE(SUM(e.amount_base), 0) AS total
        FROM expenses e
        JOIN expense_categories ec ON ec.id = e.category_id
        WHERE e.expense_date BETWEEN $1 AND $2
        GROUP BY ec.name
        ORDER BY total DESC
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(&state.db)
    .await?;

    let valuation = sqlx::query_as::<_, ValuationRow>(
        r#"
        SELECT
            l.name AS location,
            COALESCE(SUM(s.quantity), 0)::BIGINT AS units,
            COALESCE(SUM(s.quantity * s.average_cost), 0) AS value
        FROM locations l
        LEFT JOIN stock_levels s ON s.location_id = l.id
        GROUP BY l.name
        HAVING COALESCE(SUM(s.quantity), 0) > 0
        ORDER BY value DESC
        "#,
    )
    .fetch_all(&state.db)
    .await?;

    let summary = ReportSummary::build(&channels, &categories, &valuation);

    render(ReportsTemplate {
        current_user,
        date_from: from.format("%Y-%m-%d").to_string(),
        date_to: to.format("%Y-%m-%d").to_string(),
        base_currency: state.config.base_currency.clone(),
        channels,
        categories,
        valuation,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn range_defaults_to_month_to_date() {
        let (from, to) = report_range(None, None, date("2026-03-17"));
        assert_eq!(from, date("2026-03-01"));
        assert_eq!(to, date("2026-03-17"));
    }

    #[test]
    fn reversed_range_is_swapped() {
        let (from, to) = report_range(Some(date("2026-02-10")), Some(date("2026-02-01")), date("2026-03-17"));
        assert_eq!((from, to), (date("2026-02-01"), date("2026-02-10")));
    }

    #[test]
    fn summary_nets_expenses_against_sales_profit() {
        let channels = vec![
            ChannelRow {
                channel: "ebay".into(),
                sale_count: 3,
                gross: d("315"),
                fees: d("41.73"),
                net: d("259.38"),
                cogs: d("180"),
            },
            ChannelRow {
                channel: "storefront".into(),
                sale_count: 5,
                gross: d("120"),
                fees: Decimal::ZERO,
                net: d("120"),
                cogs: d("70.5"),
            },
        ];
        let categories = vec![CategoryRow {
            category: "Postage".into(),
            expense_count: 2,
            total: d("45.20"),
        }];
        let valuation = vec![
            ValuationRow { location: "Store".into(), units: 400, value: d("2500") },
            ValuationRow { location: "Vault".into(), units: 12, value: d("1800.25") },
        ];

        let summary = ReportSummary::build(&channels, &categories, &valuation);
        assert_eq!(summary.sale_count, 8);
        assert_eq!(summary.sales_profit, d("128.88"));
        assert_eq!(summary.net_profit, d("83.68"));
        assert_eq!(summary.inventory_value, d("4300.25"));
        assert_eq!(channels[0].profit(), d("79.38"));
    }

    #[test]
    fn empty_period_is_all_zero() {
        assert_eq!(ReportSummary::build(&[], &[], &[]), ReportSummary::default());
    }
}
