use axum::{
    extract::{Path, Query, State},
    response::{Html, Redirect},
};
use axum_extra::extract::Form;
use askama::Template;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    database::AppState,
    error::AppError,
    filters,
    middleware::{require_user, CurrentUser},
    models::{
        purchase::landed_unit_costs, rate::load_rate_table, Location, MovementType, Product,
        Purchase, PurchaseItem, PurchaseItemDisplay, PurchaseSummary,
    },
    stock::{self, Movement},
    utils::{
        currency::{convert, normalize_currency},
        forms::{self, redirect_with_notice},
    },
};

use super::{active_locations, active_products, render, Notice};

#[derive(Template)]
#[template(path = "purchases/list.html")]
struct PurchasesTemplate {
    current_user: CurrentUser,
    purchases: Vec<PurchaseSummary>,
    notice: String,
}

#[derive(Template)]
#[template(path = "purchases/form.html")]
struct PurchaseFormTemplate {
    current_user: CurrentUser,
    products: Vec<Product>,
    locations: Vec<Location>,
    base_currency: String,
    today: String,
    line_slots: Vec<usize>,
}

#[derive(Template)]
#[template(path = "purchases/detail.html")]
struct PurchaseDetailTemplate {
    current_user: CurrentUser,
    purchase: Purchase,
    location_name: String,
    items: Vec<PurchaseItemDisplay>,
    goods_total: Decimal,
    goods_total_base: Decimal,
    extra_costs_base: Decimal,
    base_currency: String,
    notice: String,
}

#[derive(Deserialize)]
pub struct PurchaseForm {
    supplier: Option<String>,
    order_date: Option<String>,
    currency: String,
    exchange_rate: Option<String>,
    location_id: String,
    shipping_cost: Option<String>,
    tax_cost: Option<String>,
    other_cost: Option<String>,
    notes: Option<String>,
    #[serde(default)]
    product_id: Vec<String>,
    #[serde(default)]
    quantity: Vec<String>,
    #[serde(default)]
    unit_price: Vec<String>,
}

#[derive(Debug, PartialEq)]
struct PurchaseLine {
    product_id: Uuid,
    quantity: i32,
    unit_price: Decimal,
}

impl PurchaseForm {
    fn lines(&self) -> Result<Vec<PurchaseLine>, AppError> {
        let rows = forms::filled_rows(&self.product_id);
        if rows.is_empty() {
            return Err(AppError::bad_request("Add at least one product line"));
        }

        rows.into_iter()
            .enumerate()
            .map(|(n, idx)| {
                let line = n + 1;
                Ok(PurchaseLine {
                    product_id: forms::uuid(&format!("Line {} product", line), forms::cell(&self.product_id, idx))?,
                    quantity: forms::quantity(&format!("Line {} quantity", line), forms::cell(&self.quantity, idx))?,
                    unit_price: forms::money(&format!("Line {} unit price", line), forms::cell(&self.unit_price, idx))?,
                })
            })
            .collect()
    }
}

/// Resolves the rate for a foreign-currency entry: an explicit override wins,
/// then the stored table.
pub async fn resolve_rate(
    state: &AppState,
    currency: &str,
    override_rate: Option<&str>,
) -> Result<(String, Decimal), AppError> {
    let currency = normalize_currency(currency)
        .ok_or_else(|| AppError::bad_request("Currency must be a three letter code"))?;

    if currency == state.config.base_currency {
        return Ok((currency, Decimal::ONE));
    }

    if let Some(rate) = forms::decimal("Exchange rate", override_rate)? {
        if rate <= Decimal::ZERO {
            return Err(AppError::bad_request("Exchange rate must be greater than zero"));
        }
        return Ok((currency, rate));
    }

    let table = load_rate_table(&state.db, &state.config.base_currency).await?;
    let rate = table.rate_for(&currency).ok_or_else(|| {
        AppError::bad_request(format!(
            "No exchange rate for {}. Enter one on the form or add it under Rates.",
            currency
        ))
    })?;
    Ok((currency, rate))
}

pub async fn purchases_list(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(notice): Query<Notice>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let purchases = sqlx::query_as::<_, PurchaseSummary>(
        r#"
        SELECT
            pu.id, pu.supplier, pu.order_date, pu.currency,
            l.name AS location_name,
            pu.status,
            COUNT(pi.id) AS line_count,
            COALESCE(SUM(pi.quantity), 0)::BIGINT AS unit_count,
            COALESCE(SUM(pi.quantity * pi.unit_price), 0) AS goods_total
        FROM purchases pu
        JOIN locations l ON l.id = pu.location_id
        LEFT JOIN purchase_items pi ON pi.purchase_id = pu.id
        GROUP BY pu.id, l.name
        ORDER BY pu.order_date DESC, pu.created_at DESC
        LIMIT 200
        "#,
    )
    .fetch_all(&state.db)
    .await?;

    render(PurchasesTemplate {
        current_user,
        purchases,
        notice: notice.notice,
    })
}

pub async fn purchase_form(
    State(state): State<AppState>,
    cookies: Cookies,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    render(PurchaseFormTemplate {
        current_user,
        products: active_products(&state.db).await?,
        locations: active_locations(&state.db).await?,
        base_currency: state.config.base_currency.clone(),
        today: Utc::now().date_naive().format("%Y-%m-%d").to_string(),
        line_slots: (1..=8).collect(),
    })
}

pub async fn create_purchase(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<PurchaseForm>,
) -> Result<Redirect, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let lines = form.lines()?;
    let supplier = forms::required("Supplier", form.supplier.clone())?;
    let order_date = forms::date(form.order_date.as_deref()).unwrap_or_else(|| Utc::now().date_naive());
    let location_id = forms::uuid("Receiving location", Some(&form.location_id))?;
    let shipping_cost = forms::money("Shipping", form.shipping_cost.as_deref())?;
    let tax_cost = forms::money("Tax", form.tax_cost.as_deref())?;
    let other_cost = forms::money("Other costs", form.other_cost.as_deref())?;
    let (currency, exchange_rate) = resolve_rate(&state, &form.currency, form.exchange_rate.as_deref()).await?;

    let mut tx = state.db.begin().await?;

    let purchase_id = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO purchases (
            supplier, order_date, currency, exchange_rate, location_id,
            shipping_cost, tax_cost, other_cost, notes, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING id
        "#,
    )
    .bind(&supplier)
    .bind(order_date)
    .bind(&currency)
    .bind(exchange_rate)
    .bind(location_id)
    .bind(shipping_cost)
    .bind(tax_cost)
    .bind(other_cost)
    .bind(forms::text(form.notes.clone()))
    .bind(current_user.id)
    .fetch_one(&mut *tx)
    .await?;

    for (idx, line) in lines.iter().enumerate() {
        sqlx::query(
            "INSERT INTO purchase_items (purchase_id, product_id, quantity, unit_price, line_no) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(purchase_id)
        .bind(line.product_id)
        .bind(line.quantity)
        .bind(line.unit_price)
        .bind(idx as i32 + 1)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    log::info!("{} ordered {} lines from {} ({})", current_user.display_name, lines.len(), supplier, purchase_id);

    Ok(Redirect::to(&format!("/purchases/{}", purchase_id)))
}

pub async fn purchase_detail(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(purchase_id): Path<Uuid>,
    Query(notice): Query<Notice>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let purchase = sqlx::query_as::<_, Purchase>("SELECT * FROM purchases WHERE id = $1")
        .bind(purchase_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(AppError::NotFound)?;

    let location_name = sqlx::query_scalar::<_, String>("SELECT name FROM locations WHERE id = $1")
        .bind(purchase.location_id)
        .fetch_one(&state.db)
        .await?;

    let items = sqlx::query_as::<_, PurchaseItemDisplay>(
        r#"
        SELECT
            pi.id, pi.product_id,
            p.name AS product_name, p.sku,
            pi.quantity, pi.unit_price,
            pi.quantity * pi.unit_price AS line_total,
            COALESCE(pi.landed_unit_cost::TEXT, '') AS landed_unit_cost
        FROM purchase_items pi
        JOIN products p ON p.id = pi.product_id
        WHERE pi.purchase_id = $1
        ORDER BY pi.line_no
        "#,
    )
    .bind(purchase_id)
    .fetch_all(&state.db)
    .await?;

    let goods_total: Decimal = items.iter().map(|i| i.line_total).sum();

    render(PurchaseDetailTemplate {
        current_user,
        goods_total_base: convert(goods_total, purchase.exchange_rate),
        extra_costs_base: convert(purchase.extra_costs(), purchase.exchange_rate),
        goods_total,
        location_name,
        items,
        purchase,
        base_currency: state.config.base_currency.clone(),
        notice: notice.notice,
    })
}

pub async fn receive_purchase(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(purchase_id): Path<Uuid>,
) -> Result<Redirect, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let mut tx = state.db.begin().await?;

    let purchase = sqlx::query_as::<_, Purchase>("SELECT * FROM purchases WHERE id = $1 FOR UPDATE")
        .bind(purchase_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;

    if !purchase.is_open() {
        return Err(AppError::invalid_state(format!(
            "This purchase is already {}",
            purchase.status
        )));
    }

    let items = sqlx::query_as::<_, PurchaseItem>(
        "SELECT * FROM purchase_items WHERE purchase_id = $1 ORDER BY line_no",
    )
    .bind(purchase_id)
    .fetch_all(&mut *tx)
    .await?;

    let lines: Vec<(i32, Decimal)> = items.iter().map(|i| (i.quantity, i.unit_price)).collect();
    let landed = landed_unit_costs(&lines, purchase.extra_costs(), purchase.exchange_rate);

    stock::lock_rows(&mut tx, items.iter().map(|i| (i.product_id, purchase.location_id))).await?;

    for (item, unit_cost) in items.iter().zip(landed.iter()) {
        stock::receive(
            &mut tx,
            item.product_id,
            purchase.location_id,
            item.quantity,
            *unit_cost,
            Movement::new(MovementType::Receipt, current_user.id)
                .reference(purchase.id)
                .reason(Some(purchase.supplier.as_str())),
        )
        .await?;

        sqlx::query("UPDATE purchase_items SET landed_unit_cost = $1 WHERE id = $2")
            .bind(*unit_cost)
            .bind(item.id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        "UPDATE purchases SET status = 'received', received_at = NOW(), received_by = $1 WHERE id = $2",
    )
    .bind(current_user.id)
    .bind(purchase_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    log::info!("{} received purchase {} ({} lines)", current_user.display_name, purchase_id, items.len());

    Ok(redirect_with_notice(
        &format!("/purchases/{}", purchase_id),
        &format!("Received {} lines into stock", items.len()),
    ))
}

pub async fn cancel_purchase(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(purchase_id): Path<Uuid>,
) -> Result<Redirect, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let result = sqlx::query("UPDATE purchases SET status = 'cancelled' WHERE id = $1 AND status = 'ordered'")
        .bind(purchase_id)
        .execute(&state.db)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::invalid_state("Only open purchases can be cancelled"));
    }

    log::info!("{} cancelled purchase {}", current_user.display_name, purchase_id);
    Ok(redirect_with_notice("/purchases", "Purchase cancelled"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use sqlx::PgPool;

    use crate::test_support::{self, dec, form as body, post, session};

    fn form(products: &[&str], quantities: &[&str], prices: &[&str]) -> PurchaseForm {
        let strings = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        PurchaseForm {
            supplier: Some("Distributor".into()),
            order_date: None,
            currency: "USD".into(),
            exchange_rate: None,
            location_id: Uuid::nil().to_string(),
            shipping_cost: None,
            tax_cost: None,
            other_cost: None,
            notes: None,
            product_id: strings(products),
            quantity: strings(quantities),
            unit_price: strings(prices),
        }
    }

    #[test]
    fn blank_rows_are_skipped() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let lines = form(
            &[&a.to_string(), "", &b.to_string()],
            &["6", "", "2"],
            &["100", "", "4.25"],
        )
        .lines()
        .unwrap();

        assert_eq!(
            lines,
            vec![
                PurchaseLine { product_id: a, quantity: 6, unit_price: Decimal::new(100, 0) },
                PurchaseLine { product_id: b, quantity: 2, unit_price: Decimal::new(425, 2) },
            ]
        );
    }

    #[test]
    fn an_order_needs_lines() {
        assert!(form(&["", ""], &["", ""], &["", ""]).lines().is_err());
    }

    #[test]
    fn bad_quantity_names_the_line() {
        let err = form(&[&Uuid::new_v4().to_string()], &["0"], &["1"]).lines().unwrap_err();
        assert!(err.to_string().contains("Line 1 quantity"));
    }

    #[sqlx::test]
    async fn receiving_stocks_lines_at_landed_cost(pool: PgPool) {
        let state = test_support::state(pool.clone());
        let buyer = test_support::user(&pool, "Sam", "staff").await;
        let cookie = session(&state, buyer);
        let boxes = test_support::product(&pool, "OBF-BB-JP", "Ruler of the Black Flame Box").await;
        let packs = test_support::product(&pool, "SV3-PK-JP", "Ruler of the Black Flame Pack").await;
        let back_room = test_support::location(&pool, "Back room").await;
        test_support::stock_up(&pool, buyer, boxes, back_room, 10, "5").await;
        let (boxes_id, packs_id, back_room_id) = (boxes.to_string(), packs.to_string(), back_room.to_string());

        // 10 x 1000 JPY and 5 x 2000 JPY carry equal value, so the 2000 JPY
        // shipping splits evenly. At 0.01 that is 11.00 and 22.00 a unit.
        let order = body(&[
            ("supplier", "Tokyo Card Wholesale"),
            ("currency", "JPY"),
            ("exchange_rate", "0.01"),
            ("location_id", back_room_id.as_str()),
            ("shipping_cost", "2000"),
            ("product_id", boxes_id.as_str()),
            ("quantity", "10"),
            ("unit_price", "1000"),
            ("product_id", packs_id.as_str()),
            ("quantity", "5"),
            ("unit_price", "2000"),
        ]);
        assert_eq!(post(&state, Some(&cookie), "/purchases", order).await.status(), StatusCode::SEE_OTHER);
        let purchase_id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM purchases").fetch_one(&pool).await.unwrap();

        let receive_uri = format!("/purchases/{}/receive", purchase_id);
        assert_eq!(post(&state, Some(&cookie), &receive_uri, String::new()).await.status(), StatusCode::SEE_OTHER);

        let landed = sqlx::query_scalar::<_, Option<Decimal>>(
            "SELECT landed_unit_cost FROM purchase_items WHERE purchase_id = $1 ORDER BY line_no",
        )
        .bind(purchase_id)
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(landed, vec![Some(dec("11")), Some(dec("22"))]);

        // 10 on hand at 5.00 blended with 10 received at 11.00.
        let stocked_boxes = test_support::level(&pool, boxes, back_room).await;
        assert_eq!((stocked_boxes.quantity, stocked_boxes.average_cost), (20, dec("8")));
        let stocked_packs = test_support::level(&pool, packs, back_room).await;
        assert_eq!((stocked_packs.quantity, stocked_packs.average_cost), (5, dec("22")));

        assert_eq!(post(&state, Some(&cookie), &receive_uri, String::new()).await.status(), StatusCode::CONFLICT);
        assert_eq!(test_support::level(&pool, packs, back_room).await.quantity, 5);
    }
}
