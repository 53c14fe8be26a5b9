use axum::{
    extract::{Form, Path, Query, State},
    response::{Html, Redirect},
};
use askama::Template;
use tower_cookies::Cookies;
use uuid::Uuid;
use serde::Deserialize;
use rust_decimal::Decimal;

use crate::{
    database::AppState,
    error::AppError,
    filters,
    middleware::{require_user, CurrentUser},
    models::{
        product::{is_product_type, GRADING_COMPANIES, PRODUCT_TYPES},
        MovementDisplay, Product, StockRow, MOVEMENT_DISPLAY_SQL,
    },
    utils::forms::{self, redirect_with_notice},
};

use super::render;

#[derive(Template)]
#[template(path = "products/list.html")]
struct ProductsTemplate {
    current_user: CurrentUser,
    products: Vec<ProductRow>,
    product_types: Vec<&'static str>,
    search: String,
    selected_type: String,
    show_inactive: bool,
    notice: String,
}

#[derive(Template)]
#[template(path = "products/form.html")]
struct ProductFormTemplate {
    current_user: CurrentUser,
    product: Option<Product>,
    product_types: Vec<&'static str>,
    grading_companies: Vec<&'static str>,
}

#[derive(Template)]
#[template(path = "products/detail.html")]
struct ProductDetailTemplate {
    current_user: CurrentUser,
    product: Product,
    stock: Vec<StockRow>,
    total_quantity: i64,
    total_value: Decimal,
    movements: Vec<MovementDisplay>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct ProductRow {
    pub id: Uuid,
    pub name: String,
    pub sku: String,
    pub game: String,
    pub set_name: String,
    pub product_type: String,
    pub market_price: Option<Decimal>,
    pub is_active: bool,
    pub on_hand: i64,
}

impl ProductRow {
    pub fn market_price_text(&self) -> String {
        self.market_price.map(|p| format!("{:.2}", p)).unwrap_or_default()
    }
}

#[derive(Deserialize)]
pub struct ProductFilters {
    #[serde(default)]
    q: String,
    #[serde(default)]
    product_type: String,
    inactive: Option<String>,
    #[serde(default)]
    notice: String,
}

#[derive(Deserialize)]
pub struct ProductForm {
    name: Option<String>,
    sku: Option<String>,
    game: Option<String>,
    set_name: Option<String>,
    product_type: String,
    language: Option<String>,
    condition: Option<String>,
    grading_company: Option<String>,
    grade: Option<String>,
    market_price: Option<String>,
    notes: Option<String>,
}

/// Validated product fields ready to bind.
struct ProductInput {
    name: String,
    sku: String,
    game: Option<String>,
    set_name: Option<String>,
    product_type: String,
    language: Option<String>,
    condition: Option<String>,
    grading_company: Option<String>,
    grade: Option<String>,
    market_price: Option<Decimal>,
    notes: Option<String>,
}

impl ProductForm {
    fn validate(self) -> Result<ProductInput, AppError> {
        let product_type = self.product_type.trim().to_string();
        if !is_product_type(&product_type) {
            return Err(AppError::bad_request("Unknown product type"));
        }

        let market_price = forms::optional_money("Market price", self.market_price.as_deref())?;

        let grading_company = forms::text(self.grading_company);
        let grade = forms::text(self.grade);
        if product_type == "graded" && (grading_company.is_none() || grade.is_none()) {
            return Err(AppError::bad_request("Graded products need a grading company and grade"));
        }

        Ok(ProductInput {
            name: forms::required("Name", self.name)?,
            sku: forms::required("SKU", self.sku)?.to_uppercase(),
            game: forms::text(self.game),
            set_name: forms::text(self.set_name),
            product_type,
            language: forms::text(self.language),
            condition: forms::text(self.condition),
            grading_company,
            grade,
            market_price,
            notes: forms::text(self.notes),
        })
    }
}

fn sku_conflict(e: sqlx::Error) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::bad_request("Another product already uses that SKU")
        }
        _ => AppError::from(e),
    }
}

pub async fn products_list(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(filters): Query<ProductFilters>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;
    let show_inactive = filters.inactive.is_some();

    let mut query_builder = sqlx::QueryBuilder::new(
        r#"
        SELECT
            p.id, p.name, p.sku,
            COALESCE(p.game, '') AS game,
            COALESCE(p.set_name, '') AS set_name,
            p.product_type, p.market_price, p.is_active,
            COALESCE(SUM(s.quantity), 0)::BIGINT AS on_hand
        FROM products p
        LEFT JOIN stock_levels s ON s.product_id = p.id
        WHERE 1 = 1
        "#,
    );

    if !show_inactive {
        query_builder.push(" AND p.is_active = true");
    }
    let search = filters.q.trim().to_string();
    if !search.is_empty() {
        let pattern = format!("%{}%", search);
        query_builder
            .push(" AND (p.name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR p.sku ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR p.set_name ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if is_product_type(&filters.product_type) {
        query_builder
            .push(" AND p.product_type = ")
            .push_bind(filters.product_type.clone());
    }
    query_builder.push(" GROUP BY p.id ORDER BY p.name, p.sku");

    let products = query_builder
        .build_query_as::<ProductRow>()
        .fetch_all(&state.db)
        .await?;

    render(ProductsTemplate {
        current_user,
        products,
        product_types: PRODUCT_TYPES.to_vec(),
        search,
        selected_type: filters.product_type,
        show_inactive,
        notice: filters.notice,
    })
}

pub async fn product_form(
    cookies: Cookies,
    State(state): State<AppState>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    render(ProductFormTemplate {
        current_user,
        product: None,
        product_types: PRODUCT_TYPES.to_vec(),
        grading_companies: GRADING_COMPANIES.to_vec(),
    })
}

pub async fn product_edit_form(
    cookies: Cookies,
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let product = sqlx::query_as::<_, Product>("SELECT * FROM products WHERE id = $1")
        .bind(product_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(AppError::NotFound)?;

    render(ProductFormTemplate {
        current_user,
        product: Some(product),
        product_types: PRODUCT_TYPES.to_vec(),
        grading_companies: GRADING_COMPANIES.to_vec(),
    })
}

pub async fn create_product(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<ProductForm>,
) -> Result<Redirect, AppError> {
    let current_user = require_user(&cookies, &state).await?;
    let input = form.validate()?;

    let id = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO products (
            name, sku, game, set_name, product_type, language, condition,
            grading_company, grade, market_price, notes, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING id
        "#,
    )
    .bind(&input.name)
    .bind(&input.sku)
    .bind(&input.game)
    .bind(&input.set_name)
    .bind(&input.product_type)
    .bind(&input.language)
    .bind(&input.condition)
    .bind(&input.grading_company)
    .bind(&input.grade)
    .bind(input.market_price)
    .bind(&input.notes)
    .bind(current_user.id)
    .fetch_one(&state.db)
    .await
    .map_err(sku_conflict)?;

    log::info!("{} created product {} ({})", current_user.display_name, input.sku, id);
    Ok(Redirect::to(&format!("/products/{}", id)))
}

pub async fn update_product(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(product_id): Path<Uuid>,
    Form(form): Form<ProductForm>,
) -> Result<Redirect, AppError> {
    require_user(&cookies, &state).await?;
    let input = form.validate()?;

    let result = sqlx::query(
        r#"
        UPDATE products SET
            name = $1, sku = $2, game = $3, set_name = $4, product_type = $5, language = $6,
            condition = $7, grading_company = $8, grade = $9, market_price = $10, notes = $11,
            updated_at = NOW()
        WHERE id = $12
        "#,
    )
    .bind(&input.name)
    .bind(&input.sku)
    .bind(&input.game)
    .bind(&input.set_name)
    .bind(&input.product_type)
    .bind(&input.language)
    .bind(&input.condition)
    .bind(&input.grading_company)
    .bind(&input.grade)
    .bind(input.market_price)
    .bind(&input.notes)
    .bind(product_id)
    .execute(&state.db)
    .await
    .map_err(sku_conflict)?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }

    Ok(Redirect::to(&format!("/products/{}", product_id)))
}

pub async fn deactivate_product(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(product_id): Path<Uuid>,
) -> Result<Redirect, AppError> {
    set_product_active(&state, &cookies, product_id, false).await
}

pub async fn activate_product(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(product_id): Path<Uuid>,
) -> Result<Redirect, AppError> {
    set_product_active(&state, &cookies, product_id, true).await
}

async fn set_product_active(
    state: &AppState,
    cookies: &Cookies,
    product_id: Uuid,
    is_active: bool,
) -> Result<Redirect, AppError> {
    require_user(cookies, state).await?;

    let result = sqlx::query("UPDATE products SET is_active = $1, updated_at = NOW() WHERE id = $2")
        .bind(is_active)
        .bind(product_id)
        .execute(&state.db)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }

    let notice = if is_active { "Product reactivated" } else { "Product deactivated" };
    Ok(redirect_with_notice("/products", notice))
}

pub async fn product_detail(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(product_id): Path<Uuid>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let product = sqlx::query_as::<_, Product>("SELECT * FROM products WHERE id = $1")
        .bind(product_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(AppError::NotFound)?;

    let stock = sqlx::query_as::<_, StockRow>(
        r#"
        SELECT
            s.product_id, s.location_id,
            p.name AS product_name, p.sku, p.product_type,
            l.name AS location_name,
            s.quantity, s.average_cost,
            s.quantity * s.average_cost AS total_value
        FROM stock_levels s
        JOIN products p ON p.id = s.product_id
        JOIN locations l ON l.id = s.location_id
        WHERE s.product_id = $1 AND s.quantity > 0
        ORDER BY l.name
        "#,
    )
    .bind(product_id)
    .fetch_all(&state.db)
    .await?;

    let movements = sqlx::query_as::<_, MovementDisplay>(&format!(
        "{} WHERE m.product_id = $1 ORDER BY m.moved_at DESC LIMIT 50",
        MOVEMENT_DISPLAY_SQL
    ))
    .bind(product_id)
    .fetch_all(&state.db)
    .await?;

    let total_quantity = stock.iter().map(|s| i64::from(s.quantity)).sum();
    let total_value = stock.iter().map(|s| s.total_value).sum();

    render(ProductDetailTemplate {
        current_user,
        product,
        stock,
        total_quantity,
        total_value,
        movements,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(product_type: &str) -> ProductForm {
        ProductForm {
            name: Some(" Evolving Skies Booster Box ".into()),
            sku: Some("evs-bb".into()),
            game: Some("Pokemon".into()),
            set_name: Some("".into()),
            product_type: product_type.into(),
            language: None,
            condition: None,
            grading_company: None,
            grade: None,
            market_price: Some("699.99".into()),
            notes: None,
        }
    }

    #[test]
    fn form_is_trimmed_and_sku_upper_cased() {
        let input = form("sealed").validate().unwrap();
        assert_eq!(input.name, "Evolving Skies Booster Box");
        assert_eq!(input.sku, "EVS-BB");
        assert_eq!(input.set_name, None);
        assert_eq!(input.market_price, Some(Decimal::new(69999, 2)));
    }

    #[test]
    fn graded_products_need_company_and_grade() {
        assert!(form("graded").validate().is_err());

        let mut graded = form("graded");
        graded.grading_company = Some("PSA".into());
        graded.grade = Some("10".into());
        assert!(graded.validate().is_ok());
    }

    #[test]
    fn unknown_type_and_negative_price_are_rejected() {
        assert!(form("booster").validate().is_err());

        let mut negative = form("single");
        negative.market_price = Some("-1".into());
        assert!(negative.validate().is_err());
    }
}
