use axum::{
    extract::{Form, Path, Query, State},
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
    models::{location::{is_location_kind, LOCATION_KINDS}, Location},
    utils::forms::{self, redirect_with_notice},
};

use super::{render, Notice};

#[derive(Debug, sqlx::FromRow)]
pub struct LocationRow {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub is_active: bool,
    pub units: i64,
    pub value: Decimal,
}

#[derive(Template)]
#[template(path = "locations/list.html")]
struct LocationsTemplate {
    current_user: CurrentUser,
    locations: Vec<LocationRow>,
    notice: String,
}

#[derive(Template)]
#[template(path = "locations/form.html")]
struct LocationFormTemplate {
    current_user: CurrentUser,
    location: Option<Location>,
    kinds: Vec<&'static str>,
}

#[derive(Deserialize)]
pub struct LocationForm {
    name: Option<String>,
    kind: String,
    is_active: Option<String>, // HTML checkboxes send "on" or nothing
}

impl LocationForm {
    fn validate(self) -> Result<(String, String, bool), AppError> {
        let name = forms::required("Name", self.name)?;
        let kind = self.kind.trim().to_string();
        if !is_location_kind(&kind) {
            return Err(AppError::bad_request("Unknown location kind"));
        }
        Ok((name, kind, self.is_active.is_some()))
    }
}

fn name_conflict(e: sqlx::Error) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::bad_request("A location with that name already exists")
        }
        _ => AppError::from(e),
    }
}

pub async fn locations_list(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(notice): Query<Notice>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let locations = sqlx::query_as::<_, LocationRow>(
        r#"
        SELECT
            l.id, l.name, l.kind, l.is_active,
            COALESCE(SUM(s.quantity), 0)::BIGINT AS units,
            COALESCE(SUM(s.quantity * s.average_cost), 0) AS value
        FROM locations l
        LEFT JOIN stock_levels s ON s.location_id = l.id
        GROUP BY l.id
        ORDER BY l.is_active DESC, l.name
        "#,
    )
    .fetch_all(&state.db)
    .await?;

    render(LocationsTemplate {
        current_user,
        locations,
        notice: notice.notice,
    })
}

pub async fn location_form(
    cookies: Cookies,
    State(state): State<AppState>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;
    render(LocationFormTemplate {
        current_user,
        location: None,
        kinds: LOCATION_KINDS.to_vec(),
    })
}

pub async fn location_edit_form(
    cookies: Cookies,
    State(state): State<AppState>,
    Path(location_id): Path<Uuid>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let location = sqlx::query_as::<_, Location>("SELECT * FROM locations WHERE id = $1")
        .bind(location_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(AppError::NotFound)?;

    render(LocationFormTemplate {
        current_user,
        location: Some(location),
        kinds: LOCATION_KINDS.to_vec(),
    })
}

pub async fn create_location(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<LocationForm>,
) -> Result<Redirect, AppError> {
    require_user(&cookies, &state).await?;
    let (name, kind, _) = form.validate()?;

    sqlx::query("INSERT INTO locations (name, kind) VALUES ($1, $2)")
        .bind(&name)
        .bind(&kind)
        .execute(&state.db)
        .await
        .map_err(name_conflict)?;

    Ok(redirect_with_notice("/locations", &format!("Added {}", name)))
}

pub async fn update_location(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(location_id): Path<Uuid>,
    Form(form): Form<LocationForm>,
) -> Result<Redirect, AppError> {
    require_user(&cookies, &state).await?;
    let (name, kind, is_active) = form.validate()?;

    if !is_active {
        let units = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM stock_levels WHERE location_id = $1",
        )
        .bind(location_id)
        .fetch_one(&state.db)
        .await?;
        if units > 0 {
            return Err(AppError::invalid_state(format!(
                "{} still holds {} units. Move them before deactivating it.",
                name, units
            )));
        }
    }

    let result = sqlx::query(
        "UPDATE locations SET name = $1, kind = $2, is_active = $3, updated_at = NOW() WHERE id = $4",
    )
    .bind(&name)
    .bind(&kind)
    .bind(is_active)
    .bind(location_id)
    .execute(&state.db)
    .await
    .map_err(name_conflict)?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }

    Ok(redirect_with_notice("/locations", &format!("Saved {}", name)))
}
