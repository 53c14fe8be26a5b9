pub mod auth;
pub mod costing;
pub mod currency;
pub mod forms;
pub mod pin;

pub use auth::{create_token, verify_token};
pub use pin::{hash_pin, validate_pin, verify_pin};
