use axum::{
    extract::{Form, Query, State},
    response::{Html, Redirect},
};
use askama::Template;
use rust_decimal::Decimal;
use serde::Deserialize;
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    database::AppState,
    error::AppError,
    filters,
    middleware::{require_user, CurrentUser},
    models::{Location, MovementDisplay, MovementType, Product, StockRow, MOVEMENT_DISPLAY_SQL},
    stock::{self, Movement},
    utils::forms::{self, redirect_with_notice},
};

use super::{active_locations, active_products, render};

#[derive(Template)]
#[template(path = "inventory/stock.html")]
struct StockTemplate {
    current_user: CurrentUser,
    rows: Vec<StockRow>,
    locations: Vec<Location>,
    selected_location: String,
    search: String,
    show_empty: bool,
    total_units: i64,
    total_value: Decimal,
    notice: String,
}

#[derive(Template)]
#[template(path = "inventory/move.html")]
struct MoveTemplate {
    current_user: CurrentUser,
    products: Vec<Product>,
    locations: Vec<Location>,
    selected_product: String,
    selected_location: String,
}

#[derive(Template)]
#[template(path = "inventory/count.html")]
struct CountTemplate {
    current_user: CurrentUser,
    products: Vec<Product>,
    locations: Vec<Location>,
    selected_product: String,
    selected_location: String,
}

#[derive(Template)]
#[template(path = "inventory/movements.html")]
struct MovementsTemplate {
    current_user: CurrentUser,
    movements: Vec<MovementDisplay>,
    movement_types: Vec<&'static str>,
    selected_type: String,
}

#[derive(Deserialize)]
pub struct StockFilters {
    #[serde(default)]
    location_id: String,
    #[serde(default)]
    q: String,
    empty: Option<String>,
    #[serde(default)]
    notice: String,
}

#[derive(Deserialize, Default)]
pub struct Preselect {
    #[serde(default)]
    product_id: String,
    #[serde(default)]
    location_id: String,
}

#[derive(Deserialize)]
pub struct MoveForm {
    product_id: String,
    from_location_id: String,
    to_location_id: String,
    quantity: String,
    reason: Option<String>,
}

#[derive(Deserialize)]
pub struct CountForm {
    product_id: String,
    location_id: String,
    counted: String,
    reason: Option<String>,
}

#[derive(Deserialize)]
pub struct MovementFilters {
    #[serde(default)]
    movement_type: String,
}

const MOVEMENT_TYPES: [&str; 10] = [
    "receipt",
    "transfer",
    "sale",
    "sale_void",
    "break_consume",
    "break_output",
    "grading_out",
    "grading_return",
    "adjustment",
    "stream_reconcile",
];

pub async fn stock_list(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(filters): Query<StockFilters>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;
    let show_empty = filters.empty.is_some();
    let location_id = forms::optional_uuid(Some(&filters.location_id));

    let mut query_builder = sqlx::QueryBuilder::new(
        r#"
        SELECT
            s.product_id, s.location_id,
            p.name AS product_name, p.sku, p.product_type,
            l.name AS location_name,
            s.quantity, s.average_cost,
            s.quantity * s.average_cost AS total_value
        FROM stock_levels s
        JOIN products p ON p.id = s.product_id
        JOIN locations l ON l.id = s.location_id
        WHERE 1 = 1
        "#,
    );

    if !show_empty {
        query_builder.push(" AND s.quantity > 0");
    }
    if let Some(id) = location_id {
        query_builder.push(" AND s.location_id = ").push_bind(id);
    }
    let search = filters.q.trim().to_string();
    if !search.is_empty() {
        let pattern = format!("%{}%", search);
        query_builder
            .push(" AND (p.name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR p.sku ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    query_builder.push(" ORDER BY p.name, l.name");

    let rows = query_builder
        .build_query_as::<StockRow>()
        .fetch_all(&state.db)
        .await?;

    let locations = active_locations(&state.db).await?;
    let total_units = rows.iter().map(|r| i64::from(r.quantity)).sum();
    let total_value = rows.iter().map(|r| r.total_value).sum();

    render(StockTemplate {
        current_user,
        rows,
        locations,
        selected_location: location_id.map(|id| id.to_string()).unwrap_or_default(),
        search,
        show_empty,
        total_units,
        total_value,
        notice: filters.notice,
    })
}

pub async fn move_form(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(preselect): Query<Preselect>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    render(MoveTemplate {
        current_user,
        products: active_products(&state.db).await?,
        locations: active_locations(&state.db).await?,
        selected_product: preselect.product_id,
        selected_location: preselect.location_id,
    })
}

pub async fn move_stock(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<MoveForm>,
) -> Result<Redirect, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let product_id = forms::uuid("Product", Some(&form.product_id))?;
    let from = forms::uuid("From location", Some(&form.from_location_id))?;
    let to = forms::uuid("To location", Some(&form.to_location_id))?;
    let quantity = forms::quantity("Quantity", Some(&form.quantity))?;
    let reason = forms::text(form.reason);

    let mut tx = state.db.begin().await?;
    stock::transfer(
        &mut tx,
        product_id,
        from,
        to,
        quantity,
        Movement::new(MovementType::Transfer, current_user.id).reason(reason.as_deref()),
    )
    .await?;
    tx.commit().await?;

    Ok(redirect_with_notice("/inventory", &format!("Moved {} units", quantity)))
}

pub async fn count_form(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(preselect): Query<Preselect>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    render(CountTemplate {
        current_user,
        products: active_products(&state.db).await?,
        locations: active_locations(&state.db).await?,
        selected_product: preselect.product_id,
        selected_location: preselect.location_id,
    })
}

pub async fn count_stock(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<CountForm>,
) -> Result<Redirect, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let product_id = forms::uuid("Product", Some(&form.product_id))?;
    let location_id = forms::uuid("Location", Some(&form.location_id))?;
    let counted = forms::count("Counted quantity", Some(&form.counted))?;
    let reason = forms::text(form.reason).unwrap_or_else(|| "cycle count".to_string());

    let mut tx = state.db.begin().await?;

    // A first count of something never received falls back to market price.
    let market_price = sqlx::query_scalar::<_, Option<Decimal>>("SELECT market_price FROM products WHERE id = $1")
        .bind(product_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;

    let delta = stock::set_count(
        &mut tx,
        product_id,
        location_id,
        counted,
        market_price,
        Movement::new(MovementType::Adjustment, current_user.id).reason(Some(reason.as_str())),
    )
    .await?;
    tx.commit().await?;

    let notice = match delta {
        0 => "Count matched, nothing changed".to_string(),
        d if d > 0 => format!("Count recorded, {} units added", d),
        d => format!("Count recorded, {} units removed", -d),
    };
    Ok(redirect_with_notice("/inventory", &notice))
}

pub async fn movements_list(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(filters): Query<MovementFilters>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let selected_type = if MOVEMENT_TYPES.contains(&filters.movement_type.as_str()) {
        filters.movement_type
    } else {
        String::new()
    };

    let movements = if selected_type.is_empty() {
        sqlx::query_as::<_, MovementDisplay>(&format!(
            "{} ORDER BY m.moved_at DESC LIMIT 200",
            MOVEMENT_DISPLAY_SQL
        ))
        .fetch_all(&state.db)
        .await?
    } else {
        sqlx::query_as::<_, MovementDisplay>(&format!(
            "{} WHERE m.movement_type = $1 ORDER BY m.moved_at DESC LIMIT 200",
            MOVEMENT_DISPLAY_SQL
        ))
        .bind(&selected_type)
        .fetch_all(&state.db)
        .await?
    };

    render(MovementsTemplate {
        current_user,
        movements,
        movement_types: MOVEMENT_TYPES.to_vec(),
        selected_type,
    })
}

/// Stock for one product, used by the JSON API and pick lists.
pub async fn stock_for_product(state: &AppState, product_id: Uuid) -> Result<Vec<StockRow>, AppError> {
    Ok(sqlx::query_as::<_, StockRow>(
        r#"
        SELECT
            s.product_id, s.location_id,
            p.name AS product_name, p.sku, p.product_type,
            l.name AS location_name,
            s.quantity, s.average_cost,
            s.quantity * s.average_cost AS total_value
        FROM stock_levels s
        JOIN products p ON p.id = s.product_id
        JOIN locations l ON l.id = s.location_id
        WHERE s.product_id = $1
        ORDER BY l.name
        "#,
    )
    .bind(product_id)
    .fetch_all(&state.db)
    .await?)
}
