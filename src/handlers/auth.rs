use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
};
use askama::Template;
use serde::Deserialize;
use tower_cookies::{Cookies, Cookie};
use uuid::Uuid;

use crate::{
    database::AppState,
    error::AppError,
    middleware::AUTH_COOKIE,
    models::User,
    utils::{create_token, verify_pin},
};

use super::render;

#[derive(Template)]
#[template(path = "login.html")]
struct LoginTemplate {
    error: String,
    names: Vec<String>,
}

#[derive(Deserialize)]
pub struct LoginForm {
    display_name: String,
    pin: String,
}

async fn login_names(state: &AppState) -> Result<Vec<String>, AppError> {
    Ok(sqlx::query_scalar::<_, String>(
        "SELECT display_name FROM users WHERE is_active = true ORDER BY display_name",
    )
    .fetch_all(&state.db)
    .await?)
}

async fn login_error(state: &AppState, status: StatusCode, error: &str) -> Result<Response, AppError> {
    let names = login_names(state).await?;
    let page = render(LoginTemplate {
        error: error.to_string(),
        names,
    })?;
    Ok((status, page).into_response())
}

#[derive(Debug, sqlx::FromRow)]
struct FailedAttempt {
    attempts: i32,
    locked: bool,
}

/// Counts a wrong PIN in one statement so parallel guesses cannot lose
/// increments. Locks the account on the last allowed attempt.
async fn register_failed_attempt(state: &AppState, user_id: Uuid) -> Result<FailedAttempt, AppError> {
    Ok(sqlx::query_as::<_, FailedAttempt>(
        r#"
        UPDATE users
        SET failed_pin_attempts = failed_pin_attempts + 1,
            is_locked = is_locked OR failed_pin_attempts + 1 >= $2,
            locked_at = CASE
                WHEN NOT is_locked AND failed_pin_attempts + 1 >= $2 THEN NOW()
                ELSE locked_at
            END
        WHERE id = $1
        RETURNING failed_pin_attempts AS attempts, is_locked AS locked
        "#,
    )
    .bind(user_id)
    .bind(state.config.max_pin_attempts)
    .fetch_one(&state.db)
    .await?)
}

pub async fn login_page(State(state): State<AppState>) -> Result<Html<String>, AppError> {
    // The name list is a convenience; the page still works without it.
    let names = login_names(&state).await.unwrap_or_default();
    render(LoginTemplate {
        error: String::new(),
        names,
    })
}

pub async fn login(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<LoginForm>,
) -> Result<Response, AppError> {
    let name = form.display_name.trim();

    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE display_name = $1")
        .bind(name)
        .fetch_optional(&state.db)
        .await?;

    let user = match user {
        Some(user) => user,
        None => {
            log::warn!("login attempt for unknown user '{}'", name);
            return login_error(&state, StatusCode::UNAUTHORIZED, "Invalid name or PIN").await;
        }
    };

    if !user.can_log_in() {
        log::warn!("login attempt for locked or inactive user '{}'", user.display_name);
        return login_error(
            &state,
            StatusCode::FORBIDDEN,
            "This account is locked. Ask an admin to unlock it.",
        )
        .await;
    }

    if !verify_pin(&form.pin, &user.pin_hash)? {
        let attempt = register_failed_attempt(&state, user.id).await?;
        if attempt.locked {
            log::warn!("locked '{}' after {} failed PIN attempts", user.display_name, attempt.attempts);
            return login_error(
                &state,
                StatusCode::FORBIDDEN,
                "Too many incorrect PINs. This account is now locked.",
            )
            .await;
        }
        return login_error(&state, StatusCode::UNAUTHORIZED, "Invalid name or PIN").await;
    }

    // A parallel wrong guess may have locked the account since it was read.
    let reset = sqlx::query(
        r#"
        UPDATE users SET last_login = NOW(), failed_pin_attempts = 0
        WHERE id = $1 AND is_active = true AND is_locked = false
        "#,
    )
    .bind(user.id)
    .execute(&state.db)
    .await?;

    if reset.rows_affected() == 0 {
        log::warn!("'{}' entered the right PIN after the account was locked", user.display_name);
        return login_error(
            &state,
            StatusCode::FORBIDDEN,
            "This account is locked. Ask an admin to unlock it.",
        )
        .await;
    }

    let token = create_token(
        user.id,
        user.display_name.clone(),
        user.role.clone(),
        &state.config.jwt_secret,
        state.config.session_hours,
    )?;

    // Set secure HTTP-only cookie with JWT token
    let cookie = Cookie::build((AUTH_COOKIE, token))
        .path("/")
        .http_only(true)
        .max_age(time::Duration::hours(state.config.session_hours))
        .build();

    cookies.add(cookie);
    log::info!("'{}' logged in", user.display_name);

    Ok(Redirect::to("/dashboard").into_response())
}

pub async fn logout(cookies: Cookies) -> impl IntoResponse {
    let mut cookie = Cookie::from(AUTH_COOKIE);
    cookie.set_path("/");
    cookies.remove(cookie);
    Redirect::to("/login")
}

#[cfg(test)]
mod tests {
    use axum::http::{header, StatusCode};
    use sqlx::PgPool;

    use crate::test_support::{self, form, post, MAX_PIN_ATTEMPTS, PIN};

    async fn lock_state(pool: &PgPool, name: &str) -> (i32, bool) {
        sqlx::query_as::<_, (i32, bool)>("SELECT failed_pin_attempts, is_locked FROM users WHERE display_name = $1")
            .bind(name)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    fn attempt(pin: &str) -> String {
        form(&[("display_name", "Sam"), ("pin", pin)])
    }

    #[sqlx::test]
    async fn account_locks_on_the_last_allowed_attempt(pool: PgPool) {
        let state = test_support::state(pool.clone());
        test_support::user(&pool, "Sam", "staff").await;

        for n in 1..MAX_PIN_ATTEMPTS {
            let response = post(&state, None, "/login", attempt("0000")).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(lock_state(&pool, "Sam").await, (n, false));
        }

        let response = post(&state, None, "/login", attempt("0000")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(lock_state(&pool, "Sam").await, (MAX_PIN_ATTEMPTS, true));

        // The right PIN no longer helps.
        let response = post(&state, None, "/login", attempt(PIN)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }

    #[sqlx::test]
    async fn simultaneous_wrong_pins_are_all_counted(pool: PgPool) {
        let state = test_support::state(pool.clone());
        test_support::user(&pool, "Sam", "staff").await;

        let guesses: Vec<_> = (0..MAX_PIN_ATTEMPTS)
            .map(|_| {
                let state = state.clone();
                tokio::spawn(async move { post(&state, None, "/login", attempt("0000")).await.status() })
            })
            .collect();
        let mut statuses = Vec::new();
        for guess in guesses {
            statuses.push(guess.await.unwrap());
        }

        assert_eq!(lock_state(&pool, "Sam").await, (MAX_PIN_ATTEMPTS, true));
        assert_eq!(statuses.iter().filter(|s| **s == StatusCode::FORBIDDEN).count(), 1);
    }

    #[sqlx::test]
    async fn correct_pin_clears_earlier_misses(pool: PgPool) {
        let state = test_support::state(pool.clone());
        test_support::user(&pool, "Sam", "staff").await;

        post(&state, None, "/login", attempt("0000")).await;
        post(&state, None, "/login", attempt("1111")).await;
        assert_eq!(lock_state(&pool, "Sam").await, (2, false));

        let response = post(&state, None, "/login", attempt(PIN)).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/dashboard");
        assert!(response.headers().get(header::SET_COOKIE).is_some());
        assert_eq!(lock_state(&pool, "Sam").await, (0, false));
    }
}
