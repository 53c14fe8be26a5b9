pub mod permission;

pub use permission::{require_admin, require_user, CurrentUser, AUTH_COOKIE};
