use axum::{
    extract::{Form, Path, Query, State},
    response::{Html, Redirect},
};
use askama::Template;
use serde::Deserialize;
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    database::AppState,
    error::AppError,
    middleware::{require_admin, CurrentUser},
    models::{Role, User, UserDisplay},
    utils::{
        forms::{self, redirect_with_notice},
        hash_pin, validate_pin,
    },
};

use super::{render, Notice};

#[derive(Template)]
#[template(path = "users/list.html")]
struct UsersTemplate {
    current_user: CurrentUser,
    users: Vec<UserDisplay>,
    notice: String,
}

#[derive(Template)]
#[template(path = "users/form.html")]
struct UserFormTemplate {
    current_user: CurrentUser,
    user: Option<UserDisplay>,
    roles: Vec<&'static str>,
}

#[derive(Deserialize)]
pub struct UserForm {
    display_name: Option<String>,
    role: String,
    pin: Option<String>,
    is_active: Option<String>,
}

fn name_conflict(e: sqlx::Error) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::bad_request("Someone already uses that name")
        }
        _ => AppError::from(e),
    }
}

fn role_names() -> Vec<&'static str> {
    Role::ALL.iter().map(Role::as_str).collect()
}

fn parse_role(value: &str) -> Result<Role, AppError> {
    Role::parse(value).ok_or_else(|| AppError::bad_request("Unknown role"))
}

pub async fn users_list(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(notice): Query<Notice>,
) -> Result<Html<String>, AppError> {
    let current_user = require_admin(&cookies, &state).await?;

    let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY is_active DESC, display_name")
        .fetch_all(&state.db)
        .await?
        .into_iter()
        .map(UserDisplay::from)
        .collect();

    render(UsersTemplate {
        current_user,
        users,
        notice: notice.notice,
    })
}

pub async fn user_form(
    State(state): State<AppState>,
    cookies: Cookies,
) -> Result<Html<String>, AppError> {
    let current_user = require_admin(&cookies, &state).await?;
    render(UserFormTemplate {
        current_user,
        user: None,
        roles: role_names(),
    })
}

pub async fn user_edit_form(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(user_id): Path<Uuid>,
) -> Result<Html<String>, AppError> {
    let current_user = require_admin(&cookies, &state).await?;

    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(AppError::NotFound)?;

    render(UserFormTemplate {
        current_user,
        user: Some(UserDisplay::from(user)),
        roles: role_names(),
    })
}

pub async fn create_user(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<UserForm>,
) -> Result<Redirect, AppError> {
    let current_user = require_admin(&cookies, &state).await?;

    let display_name = forms::required("Name", form.display_name)?;
    let role = parse_role(&form.role)?;
    let pin = form.pin.unwrap_or_default();
    validate_pin(&pin)?;
    let pin_hash = hash_pin(&pin)?;

    sqlx::query("INSERT INTO users (display_name, pin_hash, role) VALUES ($1, $2, $3)")
        .bind(&display_name)
        .bind(&pin_hash)
        .bind(role.as_str())
        .execute(&state.db)
        .await
        .map_err(name_conflict)?;

    log::info!("{} added user '{}' as {}", current_user.display_name, display_name, role.as_str());
    Ok(redirect_with_notice("/users", &format!("Added {}", display_name)))
}

pub async fn update_user(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(user_id): Path<Uuid>,
    Form(form): Form<UserForm>,
) -> Result<Redirect, AppError> {
    let current_user = require_admin(&cookies, &state).await?;

    let display_name = forms::required("Name", form.display_name)?;
    let role = parse_role(&form.role)?;
    let is_active = form.is_active.is_some();

    // An admin editing themself must stay an active admin.
    if current_user.id == user_id && (!is_active || role != Role::Admin) {
        return Err(AppError::bad_request("You cannot deactivate or demote yourself"));
    }

    let pin_hash = match forms::text(form.pin) {
        Some(pin) => {
            validate_pin(&pin)?;
            Some(hash_pin(&pin)?)
        }
        None => None,
    };

    let result = sqlx::query(
        r#"
        UPDATE users
        SET display_name = $1, role = $2, is_active = $3,
            pin_hash = COALESCE($4, pin_hash), updated_at = NOW()
        WHERE id = $5
        "#,
    )
    .bind(&display_name)
    .bind(role.as_str())
    .bind(is_active)
    .bind(pin_hash)
    .bind(user_id)
    .execute(&state.db)
    .await
    .map_err(name_conflict)?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }

    Ok(redirect_with_notice("/users", &format!("Saved {}", display_name)))
}

pub async fn lock_user(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(user_id): Path<Uuid>,
) -> Result<Redirect, AppError> {
    let current_user = require_admin(&cookies, &state).await?;

    // Prevent admins from locking themselves out
    if current_user.id == user_id {
        return Err(AppError::bad_request("You cannot lock your own account"));
    }

    let result = sqlx::query("UPDATE users SET is_locked = true, locked_at = NOW() WHERE id = $1")
        .bind(user_id)
        .execute(&state.db)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    log::info!("{} locked user {}", current_user.display_name, user_id);

    Ok(redirect_with_notice("/users", "User locked"))
}

pub async fn unlock_user(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(user_id): Path<Uuid>,
) -> Result<Redirect, AppError> {
    let current_user = require_admin(&cookies, &state).await?;

    let result = sqlx::query(
        "UPDATE users SET is_locked = false, locked_at = NULL, failed_pin_attempts = 0 WHERE id = $1",
    )
    .bind(user_id)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    log::info!("{} unlocked user {}", current_user.display_name, user_id);

    Ok(redirect_with_notice("/users", "User unlocked"))
}
