//! Stock ledger. Every quantity or cost change to `stock_levels` goes through
//! here, inside the caller's transaction, with the affected rows locked.

use rust_decimal::Decimal;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::MovementType,
    utils::costing::{round_cost, weighted_average},
};

/// Quantity and average cost of one product at one location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    pub quantity: i32,
    pub average_cost: Decimal,
}

impl Level {
    pub const EMPTY: Level = Level {
        quantity: 0,
        average_cost: Decimal::ZERO,
    };

    /// `None` when the new quantity would not fit the column.
    pub fn after_receipt(self, quantity: i32, unit_cost: Decimal) -> Option<Level> {
        Some(Level {
            quantity: self.quantity.checked_add(quantity)?,
            average_cost: weighted_average(self.quantity, self.average_cost, quantity, unit_cost),
        })
    }

    /// `None` when there is not enough on hand.
    pub fn after_removal(self, quantity: i32) -> Option<Level> {
        if quantity > self.quantity {
            return None;
        }
        Some(Level {
            quantity: self.quantity - quantity,
            average_cost: self.average_cost,
        })
    }

    /// New level and signed delta for a physical count.
    pub fn after_count(self, counted: i32, fallback_cost: Option<Decimal>) -> (Level, i32) {
        let average_cost = match fallback_cost {
            Some(cost) if self.quantity == 0 && self.average_cost.is_zero() => round_cost(cost),
            _ => self.average_cost,
        };
        (
            Level {
                quantity: counted,
                average_cost,
            },
            counted - self.quantity,
        )
    }
}

/// Who did it and why, recorded on the movement row.
#[derive(Debug, Clone, Copy)]
pub struct Movement<'a> {
    pub kind: MovementType,
    pub reason: Option<&'a str>,
    pub reference_id: Option<Uuid>,
    pub user_id: Uuid,
}

impl<'a> Movement<'a> {
    pub fn new(kind: MovementType, user_id: Uuid) -> Self {
        Self {
            kind,
            reason: None,
            reference_id: None,
            user_id,
        }
    }

    pub fn reference(mut self, reference_id: Uuid) -> Self {
        self.reference_id = Some(reference_id);
        self
    }

    pub fn reason(mut self, reason: Option<&'a str>) -> Self {
        self.reason = reason;
        self
    }
}

fn too_much() -> AppError {
    AppError::bad_request("That would put more stock in one place than can be tracked")
}

/// Builds the shortage error with names a person can act on.
async fn shortage(
    conn: &mut PgConnection,
    product_id: Uuid,
    location_id: Uuid,
    on_hand: i32,
    requested: i32,
) -> AppError {
    let names = sqlx::query_as::<_, (String, String, String)>(
        "SELECT p.name, p.sku, l.name FROM products p, locations l WHERE p.id = $1 AND l.id = $2",
    )
    .bind(product_id)
    .bind(location_id)
    .fetch_optional(&mut *conn)
    .await;

    let (product, location) = match names {
        Ok(Some((name, sku, location))) => (format!("{} ({})", name, sku), location),
        Ok(None) => (product_id.to_string(), location_id.to_string()),
        Err(e) => return e.into(),
    };
    AppError::InsufficientStock {
        product,
        location,
        on_hand,
        requested,
    }
}

async fn lock_or_create(
    conn: &mut PgConnection,
    product_id: Uuid,
    location_id: Uuid,
) -> Result<Level, AppError> {
    sqlx::query(
        "INSERT INTO stock_levels (product_id, location_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(product_id)
    .bind(location_id)
    .execute(&mut *conn)
    .await?;

    let (quantity, average_cost) = sqlx::query_as::<_, (i32, Decimal)>(
        "SELECT quantity, average_cost FROM stock_levels WHERE product_id = $1 AND location_id = $2 FOR UPDATE",
    )
    .bind(product_id)
    .bind(location_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Level { quantity, average_cost })
}

async fn lock_existing(
    conn: &mut PgConnection,
    product_id: Uuid,
    location_id: Uuid,
) -> Result<Level, AppError> {
    let row = sqlx::query_as::<_, (i32, Decimal)>(
        "SELECT quantity, average_cost FROM stock_levels WHERE product_id = $1 AND location_id = $2 FOR UPDATE",
    )
    .bind(product_id)
    .bind(location_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row
        .map(|(quantity, average_cost)| Level { quantity, average_cost })
        .unwrap_or(Level::EMPTY))
}

async fn store(
    conn: &mut PgConnection,
    product_id: Uuid,
    location_id: Uuid,
    level: Level,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE stock_levels SET quantity = $1, average_cost = $2, updated_at = NOW() WHERE product_id = $3 AND location_id = $4",
    )
    .bind(level.quantity)
    .bind(level.average_cost)
    .bind(product_id)
    .bind(location_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn record(
    conn: &mut PgConnection,
    product_id: Uuid,
    from: Option<Uuid>,
    to: Option<Uuid>,
    quantity: i32,
    unit_cost: Decimal,
    movement: &Movement<'_>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO stock_movements (
            product_id, from_location_id, to_location_id, quantity, unit_cost,
            movement_type, reason, reference_id, moved_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(product_id)
    .bind(from)
    .bind(to)
    .bind(quantity)
    .bind(unit_cost)
    .bind(movement.kind.as_str())
    .bind(movement.reason)
    .bind(movement.reference_id)
    .bind(movement.user_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Sorted, de-duplicated `(product, location)` keys.
pub fn lock_order(keys: impl IntoIterator<Item = (Uuid, Uuid)>) -> Vec<(Uuid, Uuid)> {
    let mut keys: Vec<_> = keys.into_iter().collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

/// Locks every row a multi-line operation is about to touch, in key order.
/// Later ledger calls on those rows in the same transaction do not wait, so
/// two operations over overlapping rows queue instead of deadlocking.
pub async fn lock_rows(
    conn: &mut PgConnection,
    keys: impl IntoIterator<Item = (Uuid, Uuid)>,
) -> Result<(), AppError> {
    for (product_id, location_id) in lock_order(keys) {
        lock_or_create(conn, product_id, location_id).await?;
    }
    Ok(())
}

/// Adds stock at `unit_cost` and returns the new average cost.
pub async fn receive(
    conn: &mut PgConnection,
    product_id: Uuid,
    location_id: Uuid,
    quantity: i32,
    unit_cost: Decimal,
    movement: Movement<'_>,
) -> Result<Decimal, AppError> {
    if quantity <= 0 {
        return Err(AppError::bad_request("quantity must be at least 1"));
    }

    let level = lock_or_create(conn, product_id, location_id).await?;
    let next = level.after_receipt(quantity, unit_cost).ok_or_else(too_much)?;
    store(conn, product_id, location_id, next).await?;
    record(conn, product_id, None, Some(location_id), quantity, round_cost(unit_cost), &movement).await?;

    log::info!(
        "{}: +{} of {} at {} @ {} (avg {} -> {})",
        movement.kind.as_str(), quantity, product_id, location_id, unit_cost, level.average_cost, next.average_cost
    );
    Ok(next.average_cost)
}

/// Takes stock out and returns the average cost it left at.
pub async fn remove(
    conn: &mut PgConnection,
    product_id: Uuid,
    location_id: Uuid,
    quantity: i32,
    movement: Movement<'_>,
) -> Result<Decimal, AppError> {
    if quantity <= 0 {
        return Err(AppError::bad_request("quantity must be at least 1"));
    }

    let level = lock_existing(conn, product_id, location_id).await?;
    let Some(next) = level.after_removal(quantity) else {
        return Err(shortage(conn, product_id, location_id, level.quantity, quantity).await);
    };
    store(conn, product_id, location_id, next).await?;
    record(conn, product_id, Some(location_id), None, quantity, level.average_cost, &movement).await?;

    log::info!(
        "{}: -{} of {} at {} @ {}",
        movement.kind.as_str(), quantity, product_id, location_id, level.average_cost
    );
    Ok(level.average_cost)
}

/// Moves stock between locations. The destination average is recomputed
/// with the source average as the incoming cost.
pub async fn transfer(
    conn: &mut PgConnection,
    product_id: Uuid,
    from: Uuid,
    to: Uuid,
    quantity: i32,
    movement: Movement<'_>,
) -> Result<Decimal, AppError> {
    if from == to {
        return Err(AppError::bad_request("source and destination must differ"));
    }
    if quantity <= 0 {
        return Err(AppError::bad_request("quantity must be at least 1"));
    }

    // Lock in a fixed order so two opposite transfers cannot deadlock.
    let (source, destination) = if from < to {
        let source = lock_or_create(conn, product_id, from).await?;
        let destination = lock_or_create(conn, product_id, to).await?;
        (source, destination)
    } else {
        let destination = lock_or_create(conn, product_id, to).await?;
        let source = lock_or_create(conn, product_id, from).await?;
        (source, destination)
    };

    let Some(source_next) = source.after_removal(quantity) else {
        return Err(shortage(conn, product_id, from, source.quantity, quantity).await);
    };
    let destination_next = destination
        .after_receipt(quantity, source.average_cost)
        .ok_or_else(too_much)?;

    store(conn, product_id, from, source_next).await?;
    store(conn, product_id, to, destination_next).await?;
    record(conn, product_id, Some(from), Some(to), quantity, source.average_cost, &movement).await?;

    log::info!(
        "transfer: {} of {} from {} to {} @ {} (destination avg {} -> {})",
        quantity, product_id, from, to, source.average_cost, destination.average_cost, destination_next.average_cost
    );
    Ok(destination_next.average_cost)
}

/// Sets on-hand to a physical count and returns the signed difference.
pub async fn set_count(
    conn: &mut PgConnection,
    product_id: Uuid,
    location_id: Uuid,
    counted: i32,
    fallback_cost: Option<Decimal>,
    movement: Movement<'_>,
) -> Result<i32, AppError> {
    if counted < 0 {
        return Err(AppError::bad_request("count cannot be negative"));
    }

    let level = lock_or_create(conn, product_id, location_id).await?;
    let (next, delta) = level.after_count(counted, fallback_cost);
    if delta == 0 && next == level {
        return Ok(0);
    }
    store(conn, product_id, location_id, next).await?;

    if delta != 0 {
        let (from, to) = if delta > 0 {
            (None, Some(location_id))
        } else {
            (Some(location_id), None)
        };
        record(conn, product_id, from, to, delta.abs(), next.average_cost, &movement).await?;
    }

    log::info!(
        "{}: {} at {} counted {} (was {}, delta {})",
        movement.kind.as_str(), product_id, location_id, counted, level.quantity, delta
    );
    Ok(delta)
}

/// Unlocked read for display and for pre-filling forms.
pub async fn current(
    conn: &mut PgConnection,
    product_id: Uuid,
    location_id: Uuid,
) -> Result<Level, AppError> {
    let row = sqlx::query_as::<_, (i32, Decimal)>(
        "SELECT quantity, average_cost FROM stock_levels WHERE product_id = $1 AND location_id = $2",
    )
    .bind(product_id)
    .bind(location_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row
        .map(|(quantity, average_cost)| Level { quantity, average_cost })
        .unwrap_or(Level::EMPTY))
}
