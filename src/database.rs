use std::sync::Arc;

use axum::extract::FromRef;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};

use crate::{
    config::{AppConfig, BootstrapAdmin},
    error::AppError,
    utils::{hash_pin, validate_pin},
};

pub type Database = Pool<Postgres>;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<AppConfig>,
}

impl FromRef<AppState> for Database {
    fn from_ref(state: &AppState) -> Database {
        state.db.clone()
    }
}

pub async fn create_database_pool(config: &AppConfig) -> Result<Database, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    // Test the connection
    sqlx::query("SELECT 1")
        .fetch_one(&pool)
        .await?;

    log::info!("connected to database");
    Ok(pool)
}

pub async fn run_migrations(db: &Database) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(db).await
}

/// Creates the first admin when nobody can log in yet.
pub async fn bootstrap_admin(db: &Database, admin: &BootstrapAdmin) -> Result<bool, AppError> {
    let user_count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
        .fetch_one(db)
        .await?;
    if user_count > 0 {
        return Ok(false);
    }

    validate_pin(&admin.pin)?;
    let pin_hash = hash_pin(&admin.pin)?;

    sqlx::query("INSERT INTO users (display_name, pin_hash, role) VALUES ($1, $2, 'admin')")
        .bind(&admin.name)
        .bind(&pin_hash)
        .execute(db)
        .await?;

    log::info!("created bootstrap admin '{}'", admin.name);
    Ok(true)
}
