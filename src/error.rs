use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
};
use askama::Template;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not signed in")]
    Unauthorized,

    #[error("you do not have access to this page")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("Only {on_hand} of {product} on hand at {location}, {requested} requested")]
    InsufficientStock {
        product: String,
        location: String,
        on_hand: i32,
        requested: i32,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("template error: {0}")]
    Template(#[from] askama::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("hash error: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        AppError::BadRequest(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        AppError::InvalidState(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidState(_) | AppError::InsufficientStock { .. } => StatusCode::CONFLICT,
            AppError::Database(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            AppError::Database(_)
            | AppError::Template(_)
            | AppError::Io(_)
            | AppError::Token(_)
            | AppError::Hash(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Unauthorized = self {
            return Redirect::to("/login").into_response();
        }

        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("request failed: {}", self);
            "Something went wrong. Please try again.".to_string()
        } else {
            log::warn!("request rejected ({}): {}", status, self);
            self.to_string()
        };

        error_page(status, &message)
    }
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate<'a> {
    status: String,
    message: &'a str,
}

fn error_page(status: StatusCode, message: &str) -> Response {
    let page = ErrorTemplate {
        status: status.to_string(),
        message,
    };
    match page.render() {
        Ok(html) => (status, Html(html)).into_response(),
        Err(e) => {
            log::error!("failed to render error page: {}", e);
            (status, message.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_redirects_to_login() {
        let response = AppError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()["location"], "/login");
    }

    #[test]
    fn stock_shortage_is_a_conflict() {
        let err = AppError::InsufficientStock {
            product: "Obsidian Flames Booster Box (OBF-BB)".into(),
            location: "Back room".into(),
            on_hand: 1,
            requested: 3,
        };
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(
            err.to_string(),
            "Only 1 of Obsidian Flames Booster Box (OBF-BB) on hand at Back room, 3 requested"
        );
    }

    #[test]
    fn missing_row_maps_to_not_found() {
        let err = AppError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn messages_are_escaped() {
        let page = ErrorTemplate {
            status: StatusCode::BAD_REQUEST.to_string(),
            message: "<script>alert(1)</script>",
        }
        .render()
        .unwrap();
        assert!(page.contains("&lt;script&gt;"));
        assert!(!page.contains("<script>"));
        assert!(page.contains("400 Bad Request"));
    }

    #[test]
    fn rejected_requests_render_the_error_page() {
        let response = AppError::bad_request("Line 1 quantity must be at least 1").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
