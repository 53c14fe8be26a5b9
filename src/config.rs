use std::env;
use std::path::PathBuf;

use thiserror::Error;

use crate::utils::currency::normalize_currency;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Admin account created on first start when the users table is empty.
#[derive(Debug, Clone)]
pub struct BootstrapAdmin {
    pub name: String,
    pub pin: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub port: u16,
    pub jwt_secret: String,
    pub base_currency: String,
    pub session_hours: i64,
    pub max_pin_attempts: i32,
    pub receipts_dir: PathBuf,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let jwt_secret = get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let base_currency = match get("BASE_CURRENCY") {
            Some(raw) => normalize_currency(&raw).ok_or(ConfigError::Invalid {
                name: "BASE_CURRENCY",
                value: raw,
            })?,
            None => "USD".to_string(),
        };

        let bootstrap_admin = match (get("ADMIN_NAME"), get("ADMIN_PIN")) {
            (Some(name), Some(pin)) => Some(BootstrapAdmin { name, pin }),
            _ => None,
        };

        Ok(Self {
            database_url,
            database_max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", 10)?,
            port: parse_or(&get, "PORT", 3000)?,
            jwt_secret,
            base_currency,
            session_hours: parse_positive(&get, "SESSION_HOURS", 12)?,
            max_pin_attempts: parse_positive(&get, "MAX_PIN_ATTEMPTS", 5)?,
            receipts_dir: get("RECEIPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("static/receipts")),
            bootstrap_admin,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => Ok(default),
    }
}

fn parse_positive<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default + ToString,
    G: Fn(&str) -> Option<String>,
{
    let value = parse_or(get, name, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid { name, value: value.to_string() });
    }
    Ok(value)
}
