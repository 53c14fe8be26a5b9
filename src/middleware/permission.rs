use serde::{Deserialize, Serialize};
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    database::AppState,
    error::AppError,
    models::{Role, User},
    utils::verify_token,
};

pub const AUTH_COOKIE: &str = "auth_token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: Uuid,
    pub display_name: String,
    pub role: Role,
    // Helper properties for templates
    pub is_admin: bool,
}

impl CurrentUser {
    pub fn from_user(user: User) -> Self {
        let role = user.role();
        Self {
            id: user.id,
            display_name: user.display_name,
            role,
            is_admin: role == Role::Admin,
        }
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

async fn get_current_user(cookies: &Cookies, state: &AppState) -> Option<CurrentUser> {
    let token = cookies.get(AUTH_COOKIE)?.value().to_string();

    let claims = match verify_token(&token, &state.config.jwt_secret) {
        Ok(claims) => claims,
        Err(e) => {
            log::debug!("rejected session token: {}", e);
            return None;
        }
    };

    let user_id = claims.user_id()?;

    // Role and lock state come from the database, not the token, so a lock
    // or demotion takes effect on the next request.
    let user = sqlx::query_as::<_, User>(
        "SELECT * FROM users WHERE id = $1 AND is_active = true AND is_locked = false",
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| log::error!("failed to load session user {}: {}", user_id, e))
    .ok()??;

    Some(CurrentUser::from_user(user))
}

/// Signed-in user or `Unauthorized` (which redirects to the login page).
pub async fn require_user(cookies: &Cookies, state: &AppState) -> Result<CurrentUser, AppError> {
    get_current_user(cookies, state).await.ok_or(AppError::Unauthorized)
}

pub async fn require_admin(cookies: &Cookies, state: &AppState) -> Result<CurrentUser, AppError> {
    let user = require_user(cookies, state).await?;
    user.require_admin()?;
    Ok(user)
}
