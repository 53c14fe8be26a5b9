use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Receipt,
    Transfer,
    Sale,
    SaleVoid,
    BreakConsume,
    BreakOutput,
    GradingOut,
    GradingReturn,
    Adjustment,
    StreamReconcile,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Receipt => "receipt",
            MovementType::Transfer => "transfer",
            MovementType::Sale => "sale",
            MovementType::SaleVoid => "sale_void",
            MovementType::BreakConsume => "break_consume",
            MovementType::BreakOutput => "break_output",
            MovementType::GradingOut => "grading_out",
            MovementType::GradingReturn => "grading_return",
            MovementType::Adjustment => "adjustment",
            MovementType::StreamReconcile => "stream_reconcile",
        }
    }
}

/// Stock joined with product and location names for listing.
#[derive(Debug, Serialize, FromRow)]
pub struct StockRow {
    pub product_id: Uuid,
    pub location_id: Uuid,
    pub product_name: String,
    pub sku: String,
    pub product_type: String,
    pub location_name: String,
    pub quantity: i32,
    pub average_cost: Decimal,
    pub total_value: Decimal,
}

#[derive(Debug, Serialize, FromRow)]
pub struct MovementDisplay {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub from_location: String,
    pub to_location: String,
    pub quantity: i32,
    pub unit_cost: Decimal,
    pub movement_type: String,
    pub reason: String,
    pub moved_by: String,
    pub moved_at: DateTime<Utc>,
}

impl MovementDisplay {
    pub fn moved_at_text(&self) -> String {
        self.moved_at.format("%Y-%m-%d %H:%M").to_string()
    }
}

/// SELECT list shared by every movement history query.
pub const MOVEMENT_DISPLAY_SQL: &str = r#"
    SELECT
        m.id,
        m.product_id,
        p.name AS product_name,
        COALESCE(lf.name, '') AS from_location,
        COALESCE(lt.name, '') AS to_location,
        m.quantity,
        m.unit_cost,
        m.movement_type,
        COALESCE(m.reason, '') AS reason,
        COALESCE(u.display_name, '') AS moved_by,
        m.moved_at
    FROM stock_movements m
    JOIN products p ON p.id = m.product_id
    LEFT JOIN locations lf ON lf.id = m.from_location_id
    LEFT JOIN locations lt ON lt.id = m.to_location_id
    LEFT JOIN users u ON u.id = m.moved_by
"#;
