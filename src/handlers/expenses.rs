use axum::{
    extract::{Form, Path, Query, State},
    response::{Html, Redirect},
};
use axum_extra::extract::Multipart;
use askama::Template;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path as FsPath, PathBuf};
use tokio::fs;
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    database::AppState,
    error::AppError,
    filters,
    middleware::{require_admin, require_user, CurrentUser},
    models::{Expense, ExpenseCategory, ExpenseDisplay},
    utils::{
        currency::convert,
        forms::{self, redirect_with_notice},
    },
};

use super::{purchases::resolve_rate, render, Notice};

const RECEIPT_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Deserialize)]
pub struct ExpenseFilters {
    #[serde(default)]
    category_id: String,
    date_from: Option<String>,
    date_to: Option<String>,
    #[serde(default)]
    notice: String,
}

#[derive(Template)]
#[template(path = "expenses/list.html")]
struct ExpensesTemplate {
    current_user: CurrentUser,
    expenses: Vec<ExpenseDisplay>,
    categories: Vec<ExpenseCategory>,
    selected_category: String,
    selected_date_from: String,
    selected_date_to: String,
    total_base: Decimal,
    base_currency: String,
    notice: String,
}

#[derive(Template)]
#[template(path = "expenses/form.html")]
struct ExpenseFormTemplate {
    current_user: CurrentUser,
    expense: Option<Expense>,
    categories: Vec<ExpenseCategory>,
    base_currency: String,
    today: String,
}

#[derive(Template)]
#[template(path = "expenses/categories.html")]
struct CategoriesTemplate {
    current_user: CurrentUser,
    categories: Vec<ExpenseCategory>,
    notice: String,
}

#[derive(Deserialize)]
pub struct CategoryForm {
    name: Option<String>,
}

async fn active_categories(state: &AppState) -> Result<Vec<ExpenseCategory>, AppError> {
    Ok(
        sqlx::query_as::<_, ExpenseCategory>("SELECT * FROM expense_categories WHERE is_active = true ORDER BY name")
            .fetch_all(&state.db)
            .await?,
    )
}

pub async fn expenses_list(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(filters): Query<ExpenseFilters>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let category_id = forms::optional_uuid(Some(&filters.category_id));
    let date_from = forms::date(filters.date_from.as_deref());
    let date_to = forms::date(filters.date_to.as_deref());

    let mut query_builder = sqlx::QueryBuilder::new(
        r#"
        SELECT
            e.id,
            ec.name AS category_name,
            COALESCE(e.vendor, '') AS vendor,
            COALESCE(e.description, '') AS description,
            e.amount, e.currency, e.amount_base,
            e.receipt_url,
            e.expense_date,
            COALESCE(u.display_name, '') AS created_by
        FROM expenses e
        JOIN expense_categories ec ON e.category_id = ec.id
        LEFT JOIN users u ON e.created_by = u.id
        WHERE 1 = 1
        "#,
    );

    if let Some(id) = category_id {
        query_builder.push(" AND e.category_id = ").push_bind(id);
    }
    if let Some(date) = date_from {
        query_builder.push(" AND e.expense_date >= ").push_bind(date);
    }
    if let Some(date) = date_to {
        query_builder.push(" AND e.expense_date <= ").push_bind(date);
    }
    query_builder.push(" ORDER BY e.expense_date DESC, e.created_at DESC");

    let expenses = query_builder
        .build_query_as::<ExpenseDisplay>()
        .fetch_all(&state.db)
        .await?;

    let total_base = expenses.iter().map(|e| e.amount_base).sum();
    let categories = sqlx::query_as::<_, ExpenseCategory>("SELECT * FROM expense_categories ORDER BY name")
        .fetch_all(&state.db)
        .await?;

    render(ExpensesTemplate {
        current_user,
        expenses,
        categories,
        selected_category: category_id.map(|id| id.to_string()).unwrap_or_default(),
        // Echo what was typed so the filter form keeps its values.
        selected_date_from: filters.date_from.unwrap_or_default(),
        selected_date_to: filters.date_to.unwrap_or_default(),
        total_base,
        base_currency: state.config.base_currency.clone(),
        notice: filters.notice,
    })
}

pub async fn expense_form(
    State(state): State<AppState>,
    cookies: Cookies,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    render(ExpenseFormTemplate {
        current_user,
        expense: None,
        categories: active_categories(&state).await?,
        base_currency: state.config.base_currency.clone(),
        today: Utc::now().date_naive().format("%Y-%m-%d").to_string(),
    })
}

pub async fn expense_edit_form(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(expense_id): Path<Uuid>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let expense = sqlx::query_as::<_, Expense>("SELECT * FROM expenses WHERE id = $1")
        .bind(expense_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(AppError::NotFound)?;

    render(ExpenseFormTemplate {
        current_user,
        expense: Some(expense),
        categories: active_categories(&state).await?,
        base_currency: state.config.base_currency.clone(),
        today: Utc::now().date_naive().format("%Y-%m-%d").to_string(),
    })
}

pub async fn create_expense(
    State(state): State<AppState>,
    cookies: Cookies,
    multipart: Multipart,
) -> Result<Redirect, AppError> {
    let current_user = require_user(&cookies, &state).await?;
    let (form_data, receipt_data) = parse_expense_multipart(multipart).await?;
    let input = form_data.validate(&state).await?;

    let receipts_dir = &state.config.receipts_dir;
    let receipt_url = save_receipt(receipts_dir, receipt_data).await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO expenses (
            category_id, vendor, description, amount, currency, exchange_rate,
            amount_base, expense_date, receipt_url, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(input.category_id)
    .bind(&input.vendor)
    .bind(&input.description)
    .bind(input.amount)
    .bind(&input.currency)
    .bind(input.exchange_rate)
    .bind(input.amount_base)
    .bind(input.expense_date)
    .bind(receipt_url.as_deref())
    .bind(current_user.id)
    .execute(&state.db)
    .await;

    if let Err(e) = inserted {
        if let Some(url) = &receipt_url {
            remove_receipt(receipts_dir, url).await;
        }
        return Err(e.into());
    }

    Ok(redirect_with_notice("/expenses", "Expense added"))
}

pub async fn update_expense(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(expense_id): Path<Uuid>,
    multipart: Multipart,
) -> Result<Redirect, AppError> {
    require_user(&cookies, &state).await?;
    let (form_data, receipt_data) = parse_expense_multipart(multipart).await?;
    let input = form_data.validate(&state).await?;

    let receipts_dir = &state.config.receipts_dir;
    let receipt_url = save_receipt(receipts_dir, receipt_data).await?;

    // COALESCE keeps the stored receipt when no new file was uploaded.
    // RETURNING hands back the receipt that was there before.
    let updated = sqlx::query_scalar::<_, Option<String>>(
        r#"
        UPDATE expenses e
        SET category_id = $1, vendor = $2, description = $3, amount = $4, currency = $5,
            exchange_rate = $6, amount_base = $7, expense_date = $8,
            receipt_url = COALESCE($9, prev.receipt_url), updated_at = NOW()
        FROM (SELECT id, receipt_url FROM expenses WHERE id = $10 FOR UPDATE) prev
        WHERE e.id = prev.id
        RETURNING prev.receipt_url
        "#,
    )
    .bind(input.category_id)
    .bind(&input.vendor)
    .bind(&input.description)
    .bind(input.amount)
    .bind(&input.currency)
    .bind(input.exchange_rate)
    .bind(input.amount_base)
    .bind(input.expense_date)
    .bind(receipt_url.as_deref())
    .bind(expense_id)
    .fetch_optional(&state.db)
    .await;

    let previous = match updated {
        Ok(Some(previous)) => previous,
        outcome => {
            if let Some(url) = &receipt_url {
                remove_receipt(receipts_dir, url).await;
            }
            return Err(match outcome {
                Err(e) => e.into(),
                Ok(_) => AppError::NotFound,
            });
        }
    };

    if receipt_url.is_some() {
        if let Some(old) = previous {
            remove_receipt(receipts_dir, &old).await;
        }
    }

    Ok(redirect_with_notice("/expenses", "Expense saved"))
}

pub async fn delete_expense(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(expense_id): Path<Uuid>,
) -> Result<Redirect, AppError> {
    let current_user = require_admin(&cookies, &state).await?;

    let receipt_url = sqlx::query_scalar::<_, Option<String>>(
        "DELETE FROM expenses WHERE id = $1 RETURNING receipt_url",
    )
    .bind(expense_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or(AppError::NotFound)?;
    log::info!("expense {} deleted by {}", expense_id, current_user.display_name);

    if let Some(url) = receipt_url {
        remove_receipt(&state.config.receipts_dir, &url).await;
    }

    Ok(redirect_with_notice("/expenses", "Expense deleted"))
}

pub async fn categories_list(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(notice): Query<Notice>,
) -> Result<Html<String>, AppError> {
    let current_user = require_admin(&cookies, &state).await?;

    let categories = sqlx::query_as::<_, ExpenseCategory>("SELECT * FROM expense_categories ORDER BY name")
        .fetch_all(&state.db)
        .await?;

    render(CategoriesTemplate {
        current_user,
        categories,
        notice: notice.notice,
    })
}

pub async fn create_category(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<CategoryForm>,
) -> Result<Redirect, AppError> {
    require_admin(&cookies, &state).await?;
    let name = forms::required("Category name", form.name)?;

    sqlx::query("INSERT INTO expense_categories (name) VALUES ($1)")
        .bind(&name)
        .execute(&state.db)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::bad_request("That category already exists")
            }
            _ => AppError::from(e),
        })?;

    Ok(redirect_with_notice("/expenses/categories", &format!("Added {}", name)))
}

pub async fn toggle_category(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(category_id): Path<Uuid>,
) -> Result<Redirect, AppError> {
    require_admin(&cookies, &state).await?;

    let result = sqlx::query("UPDATE expense_categories SET is_active = NOT is_active WHERE id = $1")
        .bind(category_id)
        .execute(&state.db)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    Ok(redirect_with_notice("/expenses/categories", "Category updated"))
}

#[derive(Default)]
struct ExpenseFormData {
    category_id: Option<String>,
    vendor: Option<String>,
    description: Option<String>,
    amount: Option<String>,
    currency: Option<String>,
    exchange_rate: Option<String>,
    expense_date: Option<String>,
}

struct ExpenseInput {
    category_id: Uuid,
    vendor: Option<String>,
    description: Option<String>,
    amount: Decimal,
    currency: String,
    exchange_rate: Decimal,
    amount_base: Decimal,
    expense_date: NaiveDate,
}

impl ExpenseFormData {
    async fn validate(self, state: &AppState) -> Result<ExpenseInput, AppError> {
        let category_id = forms::uuid("Category", self.category_id.as_deref())?;
        let amount = forms::money("Amount", self.amount.as_deref())?;
        if amount.is_zero() {
            return Err(AppError::bad_request("Amount must be greater than zero"));
        }
        let expense_date = forms::date(self.expense_date.as_deref())
            .ok_or_else(|| AppError::bad_request("Expense date is required"))?;
        let currency = self.currency.unwrap_or_else(|| state.config.base_currency.clone());
        let (currency, exchange_rate) = resolve_rate(state, &currency, self.exchange_rate.as_deref()).await?;

        Ok(ExpenseInput {
            category_id,
            vendor: forms::text(self.vendor),
            description: forms::text(self.description),
            amount,
            currency,
            exchange_rate,
            amount_base: convert(amount, exchange_rate),
            expense_date,
        })
    }
}

struct ReceiptData {
    filename: String,
    data: axum::body::Bytes,
}

async fn parse_expense_multipart(
    mut multipart: Multipart,
) -> Result<(ExpenseFormData, Option<ReceiptData>), AppError> {
    let mut form_data = ExpenseFormData::default();
    let mut receipt_data = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("Could not read the form: {}", e)))?
    {
        let name = match field.name() {
            Some(name) => name.to_string(),
            None => continue,
        };

        if name == "receipt" {
            let filename = field.file_name().map(|s| s.to_string());
            let data = field
                .bytes()
                .await
                .map_err(|e| AppError::bad_request(format!("Could not read the receipt: {}", e)))?;
            if let Some(filename) = filename.filter(|_| !data.is_empty()) {
                receipt_data = Some(ReceiptData { filename, data });
            }
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| AppError::bad_request(format!("Could not read {}: {}", name, e)))?;
            let slot = match name.as_str() {
                "category_id" => &mut form_data.category_id,
                "vendor" => &mut form_data.vendor,
                "description" => &mut form_data.description,
                "amount" => &mut form_data.amount,
                "currency" => &mut form_data.currency,
                "exchange_rate" => &mut form_data.exchange_rate,
                "expense_date" => &mut form_data.expense_date,
                _ => continue,
            };
            *slot = Some(value);
        }
    }
    Ok((form_data, receipt_data))
}

fn receipt_extension(filename: &str) -> Option<String> {
    let extension = PathBuf::from(filename)
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_lowercase)?;
    RECEIPT_EXTENSIONS.contains(&extension.as_str()).then_some(extension)
}

async fn save_receipt(receipts_dir: &FsPath, receipt_data: Option<ReceiptData>) -> Result<Option<String>, AppError> {
    let Some(receipt) = receipt_data else {
        return Ok(None);
    };
    let extension = receipt_extension(&receipt.filename)
        .ok_or_else(|| AppError::bad_request("Receipts must be PNG or JPEG images"))?;

    fs::create_dir_all(receipts_dir).await?;
    let file_name = format!("{}.{}", Uuid::new_v4(), extension);
    fs::write(receipts_dir.join(&file_name), &receipt.data).await?;
    log::info!("saved receipt {} ({} bytes)", file_name, receipt.data.len());

    Ok(Some(format!("/receipts/{}", file_name)))
}

/// Deletes the file behind a receipt URL. Failures are logged, never
/// returned, since the row change they follow has already happened.
async fn remove_receipt(receipts_dir: &FsPath, receipt_url: &str) {
    let file_name = match receipt_url.strip_prefix("/receipts/") {
        Some(name) if !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\']) => name,
        _ => {
            log::warn!("not removing receipt outside the receipts folder: {}", receipt_url);
            return;
        }
    };

    match fs::remove_file(receipts_dir.join(file_name)).await {
        Ok(()) => log::info!("removed receipt {}", file_name),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("could not remove receipt {}: {}", file_name, e),
    }
}
