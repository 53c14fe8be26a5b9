use axum::{
    extract::{Path, Query, State},
    response::{Html, Redirect},
};
use axum_extra::extract::Form;
use askama::Template;
use rust_decimal::Decimal;
use serde::Deserialize;
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    database::AppState,
    error::AppError,
    filters,
    middleware::{require_admin, require_user, CurrentUser},
    models::{
        sale::{is_sale_channel, SALE_CHANNELS},
        Location, MovementType, PricedLine, Product, Sale, SaleItem, SaleItemDisplay, SaleSummary, SaleTotals,
    },
    stock::{self, Movement},
    utils::forms::{self, redirect_with_notice},
};

use super::{active_locations, active_products, purchases::resolve_rate, render};

#[derive(Template)]
#[template(path = "sales/list.html")]
struct SalesTemplate {
    current_user: CurrentUser,
    sales: Vec<SaleSummary>,
    channels: Vec<&'static str>,
    selected_channel: String,
    base_currency: String,
    net_total: Decimal,
    profit_total: Decimal,
    notice: String,
}

#[derive(Template)]
#[template(path = "sales/form.html")]
struct SaleFormTemplate {
    current_user: CurrentUser,
    channels: Vec<&'static str>,
    products: Vec<Product>,
    locations: Vec<Location>,
    streams: Vec<OpenStream>,
    selected_stream: String,
    default_location: String,
    base_currency: String,
    line_slots: Vec<usize>,
}

#[derive(Template)]
#[template(path = "sales/detail.html")]
struct SaleDetailTemplate {
    current_user: CurrentUser,
    sale: Sale,
    items: Vec<SaleItemDisplay>,
    stream_title: String,
    recorded_by: String,
    base_currency: String,
    notice: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct OpenStream {
    pub id: Uuid,
    pub title: String,
    pub location_id: Uuid,
}

#[derive(Deserialize)]
pub struct SaleFilters {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    notice: String,
}

#[derive(Deserialize)]
pub struct NewSaleQuery {
    #[serde(default)]
    stream_id: String,
}

#[derive(Deserialize)]
pub struct SaleForm {
    channel: String,
    stream_id: Option<String>,
    buyer: Option<String>,
    currency: String,
    exchange_rate: Option<String>,
    shipping_charged: Option<String>,
    platform_fees: Option<String>,
    shipping_cost: Option<String>,
    notes: Option<String>,
    #[serde(default)]
    product_id: Vec<String>,
    #[serde(default)]
    location_id: Vec<String>,
    #[serde(default)]
    quantity: Vec<String>,
    #[serde(default)]
    unit_price: Vec<String>,
}

#[derive(Debug, PartialEq)]
struct SaleLine {
    product_id: Uuid,
    location_id: Uuid,
    quantity: i32,
    unit_price: Decimal,
}

impl SaleForm {
    /// Lines with no location pick up `default_location` (the stream's).
    fn lines(&self, default_location: Option<Uuid>) -> Result<Vec<SaleLine>, AppError> {
        let rows = forms::filled_rows(&self.product_id);
        if rows.is_empty() {
            return Err(AppError::bad_request("Add at least one item to the sale"));
        }

        rows.into_iter()
            .enumerate()
            .map(|(n, idx)| {
                let line = n + 1;
                let location_id = match forms::optional_uuid(forms::cell(&self.location_id, idx)) {
                    Some(id) => id,
                    None => default_location
                        .ok_or_else(|| AppError::bad_request(format!("Line {} location is required", line)))?,
                };
                Ok(SaleLine {
                    product_id: forms::uuid(&format!("Line {} product", line), forms::cell(&self.product_id, idx))?,
                    location_id,
                    quantity: forms::quantity(&format!("Line {} quantity", line), forms::cell(&self.quantity, idx))?,
                    unit_price: forms::money(&format!("Line {} price", line), forms::cell(&self.unit_price, idx))?,
                })
            })
            .collect()
    }
}

async fn open_streams(state: &AppState) -> Result<Vec<OpenStream>, AppError> {
    Ok(sqlx::query_as::<_, OpenStream>(
        "SELECT id, title, location_id FROM streams WHERE status = 'open' ORDER BY started_at DESC",
    )
    .fetch_all(&state.db)
    .await?)
}

pub async fn sales_list(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(filters): Query<SaleFilters>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let mut query_builder = sqlx::QueryBuilder::new(
        r#"
        SELECT
            s.id, s.channel,
            COALESCE(s.buyer, '') AS buyer,
            s.currency, s.gross_base, s.net_base, s.cogs, s.status,
            (SELECT COUNT(*) FROM sale_items si WHERE si.sale_id = s.id) AS item_count,
            s.sold_at
        FROM sales s
        "#,
    );

    let selected_channel = if is_sale_channel(&filters.channel) {
        query_builder.push(" WHERE s.channel = ").push_bind(filters.channel.clone());
        filters.channel
    } else {
        String::new()
    };
    query_builder.push(" ORDER BY s.sold_at DESC LIMIT 200");

    let sales = query_builder
        .build_query_as::<SaleSummary>()
        .fetch_all(&state.db)
        .await?;

    let completed = sales.iter().filter(|s| s.status == "completed");
    let net_total = completed.clone().map(|s| s.net_base).sum();
    let profit_total = completed.map(SaleSummary::profit).sum();

    render(SalesTemplate {
        current_user,
        sales,
        channels: SALE_CHANNELS.to_vec(),
        selected_channel,
        base_currency: state.config.base_currency.clone(),
        net_total,
        profit_total,
        notice: filters.notice,
    })
}

pub async fn sale_form(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(query): Query<NewSaleQuery>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let streams = open_streams(&state).await?;
    let selected = forms::optional_uuid(Some(&query.stream_id));
    let default_location = streams
        .iter()
        .find(|s| Some(s.id) == selected)
        .map(|s| s.location_id.to_string())
        .unwrap_or_default();

    render(SaleFormTemplate {
        current_user,
        channels: SALE_CHANNELS.to_vec(),
        products: active_products(&state.db).await?,
        locations: active_locations(&state.db).await?,
        streams,
        selected_stream: selected.map(|id| id.to_string()).unwrap_or_default(),
        default_location,
        base_currency: state.config.base_currency.clone(),
        line_slots: (1..=8).collect(),
    })
}

pub async fn create_sale(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<SaleForm>,
) -> Result<Redirect, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let channel = form.channel.trim().to_string();
    if !is_sale_channel(&channel) {
        return Err(AppError::bad_request("Unknown sales channel"));
    }

    let stream = match forms::optional_uuid(form.stream_id.as_deref()) {
        Some(id) => Some(
            sqlx::query_as::<_, (Uuid, String)>("SELECT location_id, status FROM streams WHERE id = $1")
                .bind(id)
                .fetch_optional(&state.db)
                .await?
                .ok_or_else(|| AppError::bad_request("That stream no longer exists"))
                .and_then(|(location_id, status)| {
                    if status == "open" {
                        Ok((id, location_id))
                    } else {
                        Err(AppError::invalid_state("Sales can only be added to an open stream"))
                    }
                })?,
        ),
        None => None,
    };

    let lines = form.lines(stream.map(|(_, location_id)| location_id))?;
    let shipping_charged = forms::money("Shipping charged", form.shipping_charged.as_deref())?;
    let platform_fees = forms::money("Platform fees", form.platform_fees.as_deref())?;
    let shipping_cost = forms::money("Shipping cost", form.shipping_cost.as_deref())?;
    let (currency, exchange_rate) = resolve_rate(&state, &form.currency, form.exchange_rate.as_deref()).await?;

    let sale_id = Uuid::new_v4();
    let mut tx = state.db.begin().await?;

    stock::lock_rows(&mut tx, lines.iter().map(|l| (l.product_id, l.location_id))).await?;

    let mut priced = Vec::with_capacity(lines.len());
    for line in &lines {
        let unit_cost = stock::remove(
            &mut tx,
            line.product_id,
            line.location_id,
            line.quantity,
            Movement::new(MovementType::Sale, current_user.id)
                .reference(sale_id)
                .reason(Some(channel.as_str())),
        )
        .await?;
        priced.push(PricedLine {
            quantity: line.quantity,
            unit_price: line.unit_price,
            unit_cost,
        });
    }

    let totals = SaleTotals::compute(&priced, shipping_charged, platform_fees, shipping_cost, exchange_rate);

    sqlx::query(
        r#"
        INSERT INTO sales (
            id, channel, stream_id, buyer, currency, exchange_rate, subtotal,
            shipping_charged, platform_fees, shipping_cost,
            gross_base, net_base, cogs, notes, recorded_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(sale_id)
    .bind(&channel)
    .bind(stream.map(|(id, _)| id))
    .bind(forms::text(form.buyer.clone()))
    .bind(&currency)
    .bind(exchange_rate)
    .bind(totals.subtotal)
    .bind(shipping_charged)
    .bind(platform_fees)
    .bind(shipping_cost)
    .bind(totals.gross_base)
    .bind(totals.net_base)
    .bind(totals.cogs)
    .bind(forms::text(form.notes.clone()))
    .bind(current_user.id)
    .execute(&mut *tx)
    .await?;

    for (idx, (line, priced)) in lines.iter().zip(&priced).enumerate() {
        sqlx::query(
            r#"
            INSERT INTO sale_items (sale_id, product_id, location_id, quantity, unit_price, unit_cost, line_no)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(sale_id)
        .bind(line.product_id)
        .bind(line.location_id)
        .bind(line.quantity)
        .bind(line.unit_price)
        .bind(priced.unit_cost)
        .bind(idx as i32 + 1)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    log::info!(
        "sale {} on {}: {} lines, net {} {}, cogs {}",
        sale_id, channel, lines.len(), totals.net_base, state.config.base_currency, totals.cogs
    );

    Ok(redirect_with_notice(
        &format!("/sales/{}", sale_id),
        &format!("Sale recorded. Profit {}", totals.profit()),
    ))
}

pub async fn sale_detail(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(sale_id): Path<Uuid>,
    Query(filters): Query<SaleFilters>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let sale = sqlx::query_as::<_, Sale>("SELECT * FROM sales WHERE id = $1")
        .bind(sale_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(AppError::NotFound)?;

    let items = sqlx::query_as::<_, SaleItemDisplay>(
        r#"
        SELECT p.name AS product_name, p.sku, l.name AS location_name, si.quantity, si.unit_price, si.unit_cost
        FROM sale_items si
        JOIN products p ON p.id = si.product_id
        JOIN locations l ON l.id = si.location_id
        WHERE si.sale_id = $1
        ORDER BY si.line_no
        "#,
    )
    .bind(sale_id)
    .fetch_all(&state.db)
    .await?;

    let stream_title = match sale.stream_id {
        Some(id) => sqlx::query_scalar::<_, String>("SELECT title FROM streams WHERE id = $1")
            .bind(id)
            .fetch_optional(&state.db)
            .await?
            .unwrap_or_default(),
        None => String::new(),
    };

    let recorded_by = match sale.recorded_by {
        Some(id) => sqlx::query_scalar::<_, String>("SELECT display_name FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&state.db)
            .await?
            .unwrap_or_default(),
        None => String::new(),
    };

    render(SaleDetailTemplate {
        current_user,
        sale,
        items,
        stream_title,
        recorded_by,
        base_currency: state.config.base_currency.clone(),
        notice: filters.notice,
    })
}

pub async fn void_sale(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(sale_id): Path<Uuid>,
) -> Result<Redirect, AppError> {
    let current_user = require_admin(&cookies, &state).await?;

    let mut tx = state.db.begin().await?;

    let sale = sqlx::query_as::<_, Sale>("SELECT * FROM sales WHERE id = $1 FOR UPDATE")
        .bind(sale_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;

    if sale.is_voided() {
        return Err(AppError::invalid_state("This sale is already voided"));
    }

    let items = sqlx::query_as::<_, SaleItem>("SELECT * FROM sale_items WHERE sale_id = $1 ORDER BY line_no")
        .bind(sale_id)
        .fetch_all(&mut *tx)
        .await?;

    stock::lock_rows(&mut tx, items.iter().map(|i| (i.product_id, i.location_id))).await?;

    for item in &items {
        stock::receive(
            &mut tx,
            item.product_id,
            item.location_id,
            item.quantity,
            item.unit_cost,
            Movement::new(MovementType::SaleVoid, current_user.id).reference(sale_id),
        )
        .await?;
    }

    sqlx::query("UPDATE sales SET status = 'voided', voided_at = NOW(), voided_by = $1 WHERE id = $2")
        .bind(current_user.id)
        .bind(sale_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    log::info!("sale {} voided by {}, {} lines restocked", sale_id, current_user.display_name, items.len());

    Ok(redirect_with_notice(&format!("/sales/{}", sale_id), "Sale voided and stock returned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use sqlx::PgPool;

    use crate::test_support::{self, dec, form as body, post, session};

    fn form(locations: Vec<String>) -> SaleForm {
        SaleForm {
            channel: "whatnot".into(),
            stream_id: None,
            buyer: None,
            currency: "USD".into(),
            exchange_rate: None,
            shipping_charged: None,
            platform_fees: None,
            shipping_cost: None,
            notes: None,
            product_id: vec![Uuid::new_v4().to_string(), String::new()],
            location_id: locations,
            quantity: vec!["3".into(), String::new()],
            unit_price: vec!["4.50".into(), String::new()],
        }
    }

    #[test]
    fn blank_line_location_uses_stream_location() {
        let stream_location = Uuid::new_v4();
        let lines = form(vec![String::new()]).lines(Some(stream_location)).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].location_id, stream_location);
        assert_eq!(lines[0].quantity, 3);
    }

    #[test]
    fn explicit_location_wins_over_stream() {
        let shelf = Uuid::new_v4();
        let lines = form(vec![shelf.to_string()]).lines(Some(Uuid::new_v4())).unwrap();
        assert_eq!(lines[0].location_id, shelf);
    }

    #[test]
    fn location_is_required_without_a_stream() {
        let err = form(vec![]).lines(None).unwrap_err();
        assert_eq!(err.to_string(), "Line 1 location is required");
    }

    #[sqlx::test]
    async fn short_line_rolls_back_the_whole_sale(pool: PgPool) {
        let state = test_support::state(pool.clone());
        let clerk = test_support::user(&pool, "Sam", "staff").await;
        let booster = test_support::product(&pool, "OBF-PK", "Obsidian Flames Booster Pack").await;
        let tin = test_support::product(&pool, "PAF-TIN", "Paldean Fates Tin").await;
        let counter = test_support::location(&pool, "Front counter").await;
        test_support::stock_up(&pool, clerk, booster, counter, 5, "4").await;
        test_support::stock_up(&pool, clerk, tin, counter, 1, "20").await;

        let (booster_id, tin_id, counter_id) = (booster.to_string(), tin.to_string(), counter.to_string());
        let sale = body(&[
            ("channel", "storefront"),
            ("currency", "USD"),
            ("product_id", booster_id.as_str()),
            ("location_id", counter_id.as_str()),
            ("quantity", "2"),
            ("unit_price", "6.00"),
            ("product_id", tin_id.as_str()),
            ("location_id", counter_id.as_str()),
            ("quantity", "3"),
            ("unit_price", "30.00"),
        ]);
        let response = post(&state, Some(&session(&state, clerk)), "/sales", sale).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        assert_eq!(test_support::level(&pool, booster, counter).await.quantity, 5);
        assert_eq!(test_support::level(&pool, tin, counter).await.quantity, 1);
        assert_eq!(test_support::movements(&pool, "sale").await, 0);
        let sales = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sales").fetch_one(&pool).await.unwrap();
        assert_eq!(sales, 0);
    }

    #[sqlx::test]
    async fn void_restocks_at_the_cost_recorded_on_the_sale(pool: PgPool) {
        let state = test_support::state(pool.clone());
        let owner = test_support::user(&pool, "Alex", "admin").await;
        let cookie = session(&state, owner);
        let booster = test_support::product(&pool, "OBF-PK", "Obsidian Flames Booster Pack").await;
        let counter = test_support::location(&pool, "Front counter").await;
        test_support::stock_up(&pool, owner, booster, counter, 4, "10").await;

        let (booster_id, counter_id) = (booster.to_string(), counter.to_string());
        let sale = body(&[
            ("channel", "ebay"),
            ("currency", "USD"),
            ("product_id", booster_id.as_str()),
            ("location_id", counter_id.as_str()),
            ("quantity", "2"),
            ("unit_price", "25.00"),
        ]);
        let response = post(&state, Some(&cookie), "/sales", sale).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let sale_id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM sales").fetch_one(&pool).await.unwrap();

        // A later delivery moves the average away from what the sale was costed at.
        test_support::stock_up(&pool, owner, booster, counter, 2, "40").await;
        assert_eq!(test_support::level(&pool, booster, counter).await.average_cost, dec("25"));

        let void_uri = format!("/sales/{}/void", sale_id);
        let response = post(&state, Some(&cookie), &void_uri, String::new()).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let after = test_support::level(&pool, booster, counter).await;
        assert_eq!((after.quantity, after.average_cost), (6, dec("20")));
        let restock_cost = sqlx::query_scalar::<_, Decimal>(
            "SELECT unit_cost FROM stock_movements WHERE movement_type = 'sale_void'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(restock_cost, dec("10"));

        let response = post(&state, Some(&cookie), &void_uri, String::new()).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(test_support::level(&pool, booster, counter).await.quantity, 6);
    }

    #[sqlx::test]
    async fn sales_listing_lines_in_opposite_orders_both_go_through(pool: PgPool) {
        let state = test_support::state(pool.clone());
        let clerk = test_support::user(&pool, "Sam", "staff").await;
        let cookie = session(&state, clerk);
        let booster = test_support::product(&pool, "OBF-PK", "Obsidian Flames Booster Pack").await;
        let tin = test_support::product(&pool, "PAF-TIN", "Paldean Fates Tin").await;
        let counter = test_support::location(&pool, "Front counter").await;
        test_support::stock_up(&pool, clerk, booster, counter, 10, "4").await;
        test_support::stock_up(&pool, clerk, tin, counter, 10, "20").await;
        let counter_id = counter.to_string();

        let sales: Vec<_> = (0..6)
            .map(|n| {
                let (first, second) = if n % 2 == 0 { (booster, tin) } else { (tin, booster) };
                let (first, second) = (first.to_string(), second.to_string());
                let sale = body(&[
                    ("channel", "storefront"),
                    ("currency", "USD"),
                    ("product_id", first.as_str()),
                    ("location_id", counter_id.as_str()),
                    ("quantity", "1"),
                    ("unit_price", "5.00"),
                    ("product_id", second.as_str()),
                    ("location_id", counter_id.as_str()),
                    ("quantity", "1"),
                    ("unit_price", "25.00"),
                ]);
                let (state, cookie) = (state.clone(), cookie.clone());
                tokio::spawn(async move { post(&state, Some(&cookie), "/sales", sale).await.status() })
            })
            .collect();
        for sale in sales {
            assert_eq!(sale.await.unwrap(), StatusCode::SEE_OTHER);
        }

        assert_eq!(test_support::level(&pool, booster, counter).await.quantity, 4);
        assert_eq!(test_support::level(&pool, tin, counter).await.quantity, 4);
    }
}
