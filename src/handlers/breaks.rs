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
    middleware::{require_user, CurrentUser},
    models::{
        box_break::allocate_break_cost, BoxBreakOutputDisplay, BoxBreakSummary, BreakOutput, Location,
        MovementType, Product,
    },
    stock::{self, Movement},
    utils::{
        costing::round_cost,
        forms::{self, redirect_with_notice},
    },
};

use super::{active_locations, active_products, render, Notice};

#[derive(Template)]
#[template(path = "breaks/list.html")]
struct BreaksTemplate {
    current_user: CurrentUser,
    breaks: Vec<BoxBreakSummary>,
    notice: String,
}

#[derive(Template)]
#[template(path = "breaks/form.html")]
struct BreakFormTemplate {
    current_user: CurrentUser,
    products: Vec<Product>,
    locations: Vec<Location>,
    line_slots: Vec<usize>,
}

#[derive(Template)]
#[template(path = "breaks/detail.html")]
struct BreakDetailTemplate {
    current_user: CurrentUser,
    summary: BoxBreakSummary,
    notes: String,
    outputs: Vec<BoxBreakOutputDisplay>,
}

#[derive(Deserialize)]
pub struct BreakForm {
    product_id: String,
    location_id: String,
    quantity: String,
    notes: Option<String>,
    #[serde(default)]
    output_product_id: Vec<String>,
    #[serde(default)]
    output_quantity: Vec<String>,
    #[serde(default)]
    output_value: Vec<String>,
}

impl BreakForm {
    fn outputs(&self, source: Uuid) -> Result<Vec<BreakOutput>, AppError> {
        let rows = forms::filled_rows(&self.output_product_id);
        if rows.is_empty() {
            return Err(AppError::bad_request("Add at least one output product"));
        }

        let outputs = rows
            .into_iter()
            .enumerate()
            .map(|(n, idx)| {
                let line = n + 1;
                Ok(BreakOutput {
                    product_id: forms::uuid(
                        &format!("Output {} product", line),
                        forms::cell(&self.output_product_id, idx),
                    )?,
                    quantity: forms::quantity(
                        &format!("Output {} quantity", line),
                        forms::cell(&self.output_quantity, idx),
                    )?,
                    unit_value: forms::optional_money(
                        &format!("Output {} value", line),
                        forms::cell(&self.output_value, idx),
                    )?,
                })
            })
            .collect::<Result<Vec<_>, AppError>>()?;

        if outputs.iter().any(|o| o.product_id == source) {
            return Err(AppError::bad_request("A box cannot break into itself"));
        }
        Ok(outputs)
    }
}

const SUMMARY_SQL: &str = r#"
    SELECT
        b.id,
        p.name AS product_name,
        l.name AS location_name,
        b.quantity,
        b.total_cost,
        COALESCE((SELECT SUM(o.quantity) FROM box_break_outputs o WHERE o.break_id = b.id), 0)::BIGINT AS output_units,
        COALESCE(u.display_name, '') AS broken_by,
        b.broken_at
    FROM box_breaks b
    JOIN products p ON p.id = b.product_id
    JOIN locations l ON l.id = b.location_id
    LEFT JOIN users u ON u.id = b.broken_by
"#;

pub async fn breaks_list(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(notice): Query<Notice>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let breaks = sqlx::query_as::<_, BoxBreakSummary>(&format!(
        "{} ORDER BY b.broken_at DESC LIMIT 200",
        SUMMARY_SQL
    ))
    .fetch_all(&state.db)
    .await?;

    render(BreaksTemplate {
        current_user,
        breaks,
        notice: notice.notice,
    })
}

pub async fn break_form(
    State(state): State<AppState>,
    cookies: Cookies,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    render(BreakFormTemplate {
        current_user,
        products: active_products(&state.db).await?,
        locations: active_locations(&state.db).await?,
        line_slots: (1..=6).collect(),
    })
}

pub async fn create_break(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<BreakForm>,
) -> Result<Redirect, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let product_id = forms::uuid("Product", Some(&form.product_id))?;
    let location_id = forms::uuid("Location", Some(&form.location_id))?;
    let quantity = forms::quantity("Boxes to break", Some(&form.quantity))?;
    let outputs = form.outputs(product_id)?;

    let mut tx = state.db.begin().await?;

    let break_id = Uuid::new_v4();
    stock::lock_rows(
        &mut tx,
        std::iter::once((product_id, location_id)).chain(outputs.iter().map(|o| (o.product_id, location_id))),
    )
    .await?;

    let average = stock::remove(
        &mut tx,
        product_id,
        location_id,
        quantity,
        Movement::new(MovementType::BreakConsume, current_user.id).reference(break_id),
    )
    .await?;
    let total_cost = round_cost(Decimal::from(quantity) * average);

    sqlx::query(
        r#"
        INSERT INTO box_breaks (id, product_id, location_id, quantity, total_cost, notes, broken_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(break_id)
    .bind(product_id)
    .bind(location_id)
    .bind(quantity)
    .bind(total_cost)
    .bind(forms::text(form.notes.clone()))
    .bind(current_user.id)
    .execute(&mut *tx)
    .await?;

    let unit_costs = allocate_break_cost(total_cost, &outputs);
    for (idx, (output, unit_cost)) in outputs.iter().zip(unit_costs).enumerate() {
        stock::receive(
            &mut tx,
            output.product_id,
            location_id,
            output.quantity,
            unit_cost,
            Movement::new(MovementType::BreakOutput, current_user.id).reference(break_id),
        )
        .await?;

        sqlx::query(
            r#"
            INSERT INTO box_break_outputs (break_id, product_id, quantity, unit_value, allocated_unit_cost, line_no)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(break_id)
        .bind(output.product_id)
        .bind(output.quantity)
        .bind(output.unit_value)
        .bind(unit_cost)
        .bind(idx as i32 + 1)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    log::info!(
        "box break {}: {} x {} at {} into {} output lines, cost {}",
        break_id, quantity, product_id, location_id, outputs.len(), total_cost
    );

    Ok(redirect_with_notice(&format!("/breaks/{}", break_id), "Break recorded"))
}

pub async fn break_detail(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(break_id): Path<Uuid>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let summary = sqlx::query_as::<_, BoxBreakSummary>(&format!("{} WHERE b.id = $1", SUMMARY_SQL))
        .bind(break_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(AppError::NotFound)?;

    let notes = sqlx::query_scalar::<_, Option<String>>("SELECT notes FROM box_breaks WHERE id = $1")
        .bind(break_id)
        .fetch_one(&state.db)
        .await?
        .unwrap_or_default();

    let outputs = sqlx::query_as::<_, BoxBreakOutputDisplay>(
        r#"
        SELECT
            o.product_id, p.name AS product_name, p.sku, o.quantity,
            COALESCE(o.unit_value::TEXT, '') AS unit_value,
            o.allocated_unit_cost
        FROM box_break_outputs o
        JOIN products p ON p.id = o.product_id
        WHERE o.break_id = $1
        ORDER BY o.line_no
        "#,
    )
    .bind(break_id)
    .fetch_all(&state.db)
    .await?;

    render(BreakDetailTemplate {
        current_user,
        summary,
        notes,
        outputs,
    })
}
