use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Path, Query, State},
    response::{Html, Redirect},
};
use axum_extra::extract::Form;
use askama::Template;
use serde::Deserialize;
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    database::AppState,
    error::AppError,
    filters,
    middleware::{require_user, CurrentUser},
    models::{Location, MovementType, Product, SaleSummary, StockRow, Stream, StreamLine, StreamReconciliation, StreamSummary},
    stock::{self, Movement},
    utils::forms::{self, redirect_with_notice},
};

use super::{active_locations, active_products, render, Notice};

#[derive(Template)]
#[template(path = "streams/list.html")]
struct StreamsTemplate {
    current_user: CurrentUser,
    streams: Vec<StreamSummary>,
    notice: String,
}

#[derive(Template)]
#[template(path = "streams/form.html")]
struct StreamFormTemplate {
    current_user: CurrentUser,
    products: Vec<Product>,
    locations: Vec<Location>,
    selected_location: String,
    on_hand: Vec<StockRow>,
    line_slots: Vec<usize>,
}

#[derive(Template)]
#[template(path = "streams/detail.html")]
struct StreamDetailTemplate {
    current_user: CurrentUser,
    stream: Stream,
    location_name: String,
    lines: Vec<StreamLine>,
    summary: StreamReconciliation,
    sales: Vec<SaleSummary>,
    notice: String,
}

#[derive(Deserialize)]
pub struct NewStreamQuery {
    #[serde(default)]
    location_id: String,
}

#[derive(Deserialize)]
pub struct StreamForm {
    title: Option<String>,
    platform: Option<String>,
    location_id: String,
    #[serde(default)]
    product_id: Vec<String>,
    #[serde(default)]
    start_count: Vec<String>,
}

#[derive(Deserialize)]
pub struct EndCountForm {
    #[serde(default)]
    product_id: Vec<String>,
    #[serde(default)]
    end_count: Vec<String>,
}

/// Reads `(product, count)` pairs from parallel form columns. A product may
/// appear only once.
fn count_rows(products: &[String], counts: &[String]) -> Result<Vec<(Uuid, i32)>, AppError> {
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for (n, idx) in forms::filled_rows(products).into_iter().enumerate() {
        let line = n + 1;
        let product_id = forms::uuid(&format!("Row {} product", line), forms::cell(products, idx))?;
        let count = forms::count(&format!("Row {} count", line), forms::cell(counts, idx))?;
        if !seen.insert(product_id) {
            return Err(AppError::bad_request("Each product can only be counted once"));
        }
        rows.push((product_id, count));
    }
    Ok(rows)
}

async fn load_stream(state: &AppState, stream_id: Uuid) -> Result<Stream, AppError> {
    sqlx::query_as::<_, Stream>("SELECT * FROM streams WHERE id = $1")
        .bind(stream_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(AppError::NotFound)
}

const STREAM_LINES_SQL: &str = r#"
    SELECT
        sc.product_id,
        p.name AS product_name,
        sc.system_start, sc.start_count, sc.end_count,
        COALESCE((
            SELECT SUM(si.quantity)
            FROM sale_items si
            JOIN sales s ON s.id = si.sale_id
            WHERE s.stream_id = sc.stream_id
              AND s.status = 'completed'
              AND si.product_id = sc.product_id
              AND si.location_id = $2
        ), 0)::BIGINT AS sold
    FROM stream_counts sc
    JOIN products p ON p.id = sc.product_id
    WHERE sc.stream_id = $1
    ORDER BY p.name
"#;

pub async fn streams_list(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(notice): Query<Notice>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let streams = sqlx::query_as::<_, StreamSummary>(
        r#"
        SELECT
            st.id, st.title, st.platform,
            l.name AS location_name,
            st.status,
            (SELECT COUNT(*) FROM stream_counts sc WHERE sc.stream_id = st.id) AS product_count,
            st.started_at
        FROM streams st
        JOIN locations l ON l.id = st.location_id
        ORDER BY st.started_at DESC
        LIMIT 100
        "#,
    )
    .fetch_all(&state.db)
    .await?;

    render(StreamsTemplate {
        current_user,
        streams,
        notice: notice.notice,
    })
}

pub async fn stream_form(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(query): Query<NewStreamQuery>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;
    let location_id = forms::optional_uuid(Some(&query.location_id));

    // Pre-fill the count sheet with what the system thinks is there.
    let on_hand = match location_id {
        Some(id) => sqlx::query_as::<_, StockRow>(
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
            WHERE s.location_id = $1 AND s.quantity > 0
            ORDER BY p.name
            "#,
        )
        .bind(id)
        .fetch_all(&state.db)
        .await?,
        None => Vec::new(),
    };

    render(StreamFormTemplate {
        current_user,
        products: active_products(&state.db).await?,
        locations: active_locations(&state.db).await?,
        selected_location: location_id.map(|id| id.to_string()).unwrap_or_default(),
        on_hand,
        line_slots: (1..=5).collect(),
    })
}

pub async fn start_stream(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<StreamForm>,
) -> Result<Redirect, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let title = forms::required("Title", form.title.clone())?;
    let platform = forms::required("Platform", form.platform.clone())?;
    let location_id = forms::uuid("Location", Some(&form.location_id))?;
    let counts = count_rows(&form.product_id, &form.start_count)?;
    if counts.is_empty() {
        return Err(AppError::bad_request("Count at least one product before going live"));
    }

    let mut tx = state.db.begin().await?;

    let stream_id = sqlx::query_scalar::<_, Uuid>(
        "INSERT INTO streams (title, platform, location_id, created_by) VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(&title)
    .bind(&platform)
    .bind(location_id)
    .bind(current_user.id)
    .fetch_one(&mut *tx)
    .await?;

    for (product_id, start_count) in &counts {
        let system = stock::current(&mut tx, *product_id, location_id).await?;
        sqlx::query(
            "INSERT INTO stream_counts (stream_id, product_id, system_start, start_count) VALUES ($1, $2, $3, $4)",
        )
        .bind(stream_id)
        .bind(product_id)
        .bind(system.quantity)
        .bind(start_count)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    log::info!("stream {} '{}' started with {} products counted", stream_id, title, counts.len());

    Ok(redirect_with_notice(&format!("/streams/{}", stream_id), "Stream started"))
}

pub async fn stream_detail(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(stream_id): Path<Uuid>,
    Query(notice): Query<Notice>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;
    let stream = load_stream(&state, stream_id).await?;

    let location_name = sqlx::query_scalar::<_, String>("SELECT name FROM locations WHERE id = $1")
        .bind(stream.location_id)
        .fetch_one(&state.db)
        .await?;

    let lines = sqlx::query_as::<_, StreamLine>(STREAM_LINES_SQL)
        .bind(stream_id)
        .bind(stream.location_id)
        .fetch_all(&state.db)
        .await?;

    let sales = sqlx::query_as::<_, SaleSummary>(
        r#"
        SELECT
            s.id, s.channel,
            COALESCE(s.buyer, '') AS buyer,
            s.currency, s.gross_base, s.net_base, s.cogs, s.status,
            (SELECT COUNT(*) FROM sale_items si WHERE si.sale_id = s.id) AS item_count,
            s.sold_at
        FROM sales s
        WHERE s.stream_id = $1
        ORDER BY s.sold_at
        "#,
    )
    .bind(stream_id)
    .fetch_all(&state.db)
    .await?;

    let summary = StreamReconciliation::from_lines(&lines);

    render(StreamDetailTemplate {
        current_user,
        stream,
        location_name,
        lines,
        summary,
        sales,
        notice: notice.notice,
    })
}

pub async fn end_stream(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(stream_id): Path<Uuid>,
    Form(form): Form<EndCountForm>,
) -> Result<Redirect, AppError> {
    require_user(&cookies, &state).await?;
    let counts: HashMap<Uuid, i32> = count_rows(&form.product_id, &form.end_count)?.into_iter().collect();

    let mut tx = state.db.begin().await?;

    let status = sqlx::query_scalar::<_, String>("SELECT status FROM streams WHERE id = $1 FOR UPDATE")
        .bind(stream_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;
    if status != "open" {
        return Err(AppError::invalid_state("This stream has already been counted"));
    }

    let products = sqlx::query_scalar::<_, Uuid>("SELECT product_id FROM stream_counts WHERE stream_id = $1")
        .bind(stream_id)
        .fetch_all(&mut *tx)
        .await?;

    for product_id in &products {
        let end_count = counts
            .get(product_id)
            .copied()
            .ok_or_else(|| AppError::bad_request("Enter an ending count for every product"))?;
        sqlx::query("UPDATE stream_counts SET end_count = $1 WHERE stream_id = $2 AND product_id = $3")
            .bind(end_count)
            .bind(stream_id)
            .bind(product_id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query("UPDATE streams SET status = 'counted', ended_at = NOW() WHERE id = $1")
        .bind(stream_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(redirect_with_notice(&format!("/streams/{}", stream_id), "Ending counts saved"))
}

pub async fn reconcile_stream(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(stream_id): Path<Uuid>,
) -> Result<Redirect, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let mut tx = state.db.begin().await?;

    let stream = sqlx::query_as::<_, Stream>("SELECT * FROM streams WHERE id = $1 FOR UPDATE")
        .bind(stream_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;
    if stream.status != "counted" {
        return Err(AppError::invalid_state(
            "Only a counted stream can be reconciled, and only once",
        ));
    }

    let lines = sqlx::query_as::<_, StreamLine>(STREAM_LINES_SQL)
        .bind(stream_id)
        .bind(stream.location_id)
        .fetch_all(&mut *tx)
        .await?;

    stock::lock_rows(&mut tx, lines.iter().map(|l| (l.product_id, stream.location_id))).await?;

    let reason = format!("stream: {}", stream.title);
    let mut adjusted = 0;
    for line in &lines {
        let Some(end_count) = line.end_count else {
            return Err(AppError::invalid_state("Ending counts are incomplete"));
        };
        let delta = stock::set_count(
            &mut tx,
            line.product_id,
            stream.location_id,
            end_count,
            None,
            Movement::new(MovementType::StreamReconcile, current_user.id)
                .reference(stream_id)
                .reason(Some(reason.as_str())),
        )
        .await?;
        if delta != 0 {
            adjusted += 1;
        }
    }

    sqlx::query("UPDATE streams SET status = 'reconciled', reconciled_at = NOW() WHERE id = $1")
        .bind(stream_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    log::info!("stream {} reconciled, {} of {} products adjusted", stream_id, adjusted, lines.len());

    Ok(redirect_with_notice(
        &format!("/streams/{}", stream_id),
        &format!("Reconciled. {} products adjusted.", adjusted),
    ))
}
