use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use chrono::{DateTime, Utc};

pub const LOCATION_KINDS: [&str; 4] = ["store", "storage", "stream", "offsite"];

pub fn is_location_kind(kind: &str) -> bool {
    LOCATION_KINDS.contains(&kind)
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Location {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
