use axum::{
    extract::{Path, Query, State},
    response::{Html, Redirect},
};
use axum_extra::extract::Form;
use askama::Template;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    database::AppState,
    error::AppError,
    filters,
    middleware::{require_user, CurrentUser},
    models::{
        grading::shipping_shares, product::GRADING_COMPANIES, GradingItem, GradingItemDisplay,
        GradingSubmission, GradingSummary, Location, MovementType, Product,
    },
    stock::{self, Movement},
    utils::forms::{self, redirect_with_notice},
};

use super::{active_locations, active_products, render, Notice};

#[derive(Template)]
#[template(path = "grading/list.html")]
struct GradingTemplate {
    current_user: CurrentUser,
    submissions: Vec<GradingSummary>,
    notice: String,
}

#[derive(Template)]
#[template(path = "grading/form.html")]
struct GradingFormTemplate {
    current_user: CurrentUser,
    companies: Vec<&'static str>,
    products: Vec<Product>,
    locations: Vec<Location>,
    today: String,
    line_slots: Vec<usize>,
}

#[derive(Template)]
#[template(path = "grading/detail.html")]
struct GradingDetailTemplate {
    current_user: CurrentUser,
    submission: GradingSubmission,
    items: Vec<GradingItemDisplay>,
    products: Vec<Product>,
    locations: Vec<Location>,
    total_fees: Decimal,
    notice: String,
}

#[derive(Deserialize)]
pub struct SubmissionForm {
    company: String,
    submission_number: Option<String>,
    service_level: Option<String>,
    submitted_on: Option<String>,
    shipping_cost: Option<String>,
    notes: Option<String>,
    #[serde(default)]
    product_id: Vec<String>,
    #[serde(default)]
    location_id: Vec<String>,
    #[serde(default)]
    grading_fee: Vec<String>,
    #[serde(default)]
    declared_value: Vec<String>,
}

#[derive(Debug, PartialEq)]
struct SubmittedCard {
    product_id: Uuid,
    location_id: Uuid,
    grading_fee: Decimal,
    declared_value: Option<Decimal>,
}

impl SubmissionForm {
    fn cards(&self) -> Result<Vec<SubmittedCard>, AppError> {
        let rows = forms::filled_rows(&self.product_id);
        if rows.is_empty() {
            return Err(AppError::bad_request("Add at least one card to the submission"));
        }

        rows.into_iter()
            .enumerate()
            .map(|(n, idx)| {
                let line = n + 1;
                Ok(SubmittedCard {
                    product_id: forms::uuid(&format!("Card {}", line), forms::cell(&self.product_id, idx))?,
                    location_id: forms::uuid(
                        &format!("Card {} location", line),
                        forms::cell(&self.location_id, idx),
                    )?,
                    grading_fee: forms::money(&format!("Card {} fee", line), forms::cell(&self.grading_fee, idx))?,
                    declared_value: forms::optional_money(
                        &format!("Card {} declared value", line),
                        forms::cell(&self.declared_value, idx),
                    )?,
                })
            })
            .collect()
    }
}

#[derive(Deserialize)]
pub struct ReturnForm {
    grade: Option<String>,
    graded_product_id: Option<String>,
    return_location_id: String,
}

pub async fn grading_list(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(notice): Query<Notice>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let submissions = sqlx::query_as::<_, GradingSummary>(
        r#"
        SELECT
            g.id, g.company,
            COALESCE(g.submission_number, '') AS submission_number,
            g.status, g.submitted_on,
            COUNT(gi.id) AS item_count,
            COUNT(gi.returned_at) AS returned_count,
            COALESCE(SUM(gi.grading_fee), 0) AS total_fees
        FROM grading_submissions g
        LEFT JOIN grading_items gi ON gi.submission_id = g.id
        GROUP BY g.id
        ORDER BY g.status = 'returned', g.submitted_on DESC
        "#,
    )
    .fetch_all(&state.db)
    .await?;

    render(GradingTemplate {
        current_user,
        submissions,
        notice: notice.notice,
    })
}

pub async fn grading_form(
    State(state): State<AppState>,
    cookies: Cookies,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    render(GradingFormTemplate {
        current_user,
        companies: GRADING_COMPANIES.to_vec(),
        products: active_products(&state.db).await?,
        locations: active_locations(&state.db).await?,
        today: Utc::now().date_naive().format("%Y-%m-%d").to_string(),
        line_slots: (1..=10).collect(),
    })
}

pub async fn create_submission(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<SubmissionForm>,
) -> Result<Redirect, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let company = form.company.trim().to_string();
    if !GRADING_COMPANIES.contains(&company.as_str()) {
        return Err(AppError::bad_request("Unknown grading company"));
    }
    let cards = form.cards()?;
    let submitted_on = forms::date(form.submitted_on.as_deref()).unwrap_or_else(|| Utc::now().date_naive());
    let shipping_cost = forms::money("Shipping", form.shipping_cost.as_deref())?;

    let mut tx = state.db.begin().await?;

    let submission_id = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO grading_submissions
            (company, submission_number, service_level, shipping_cost, submitted_on, notes, created_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(&company)
    .bind(forms::text(form.submission_number.clone()))
    .bind(forms::text(form.service_level.clone()))
    .bind(shipping_cost)
    .bind(submitted_on)
    .bind(forms::text(form.notes.clone()))
    .bind(current_user.id)
    .fetch_one(&mut *tx)
    .await?;

    stock::lock_rows(&mut tx, cards.iter().map(|c| (c.product_id, c.location_id))).await?;

    let shares = shipping_shares(shipping_cost, cards.len());
    for (idx, (card, share)) in cards.iter().zip(shares).enumerate() {
        let raw_cost = stock::remove(
            &mut tx,
            card.product_id,
            card.location_id,
            1,
            Movement::new(MovementType::GradingOut, current_user.id)
                .reference(submission_id)
                .reason(Some(company.as_str())),
        )
        .await?;

        sqlx::query(
            r#"
            INSERT INTO grading_items
                (submission_id, product_id, origin_location_id, raw_cost, grading_fee, shipping_share, declared_value, line_no)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(submission_id)
        .bind(card.product_id)
        .bind(card.location_id)
        .bind(raw_cost)
        .bind(card.grading_fee)
        .bind(share)
        .bind(card.declared_value)
        .bind(idx as i32 + 1)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    log::info!("grading submission {} to {} with {} cards", submission_id, company, cards.len());

    Ok(redirect_with_notice(
        &format!("/grading/{}", submission_id),
        &format!("Submitted {} cards to {}", cards.len(), company),
    ))
}

pub async fn submission_detail(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(submission_id): Path<Uuid>,
    Query(notice): Query<Notice>,
) -> Result<Html<String>, AppError> {
    let current_user = require_user(&cookies, &state).await?;

    let submission = sqlx::query_as::<_, GradingSubmission>("SELECT * FROM grading_submissions WHERE id = $1")
        .bind(submission_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(AppError::NotFound)?;

    let items = sqlx::query_as::<_, GradingItemDisplay>(
        r#"
        SELECT
            gi.id,
            p.name AS product_name,
            l.name AS origin_location,
            gi.raw_cost, gi.grading_fee, gi.shipping_share,
            COALESCE(gi.declared_value::TEXT, '') AS declared_value,
            COALESCE(gi.grade, '') AS grade,
            COALESCE(gp.name, '') AS graded_product,
            gi.returned_at IS NOT NULL AS is_returned
        FROM grading_items gi
        JOIN products p ON p.id = gi.product_id
        JOIN locations l ON l.id = gi.origin_location_id
        LEFT JOIN products gp ON gp.id = gi.graded_product_id
        WHERE gi.submission_id = $1
        ORDER BY gi.line_no
        "#,
    )
    .bind(submission_id)
    .fetch_all(&state.db)
    .await?;

    let total_fees = items.iter().map(|i| i.grading_fee).sum();

    render(GradingDetailTemplate {
        current_user,
        submission,
        items,
        products: active_products(&state.db).await?,
        locations: active_locations(&state.db).await?,
        total_fees,
        notice: notice.notice,
    })
}

pub async fn return_item(
    State(state): State<AppState>,
    cookies: Cookies,
    Path((submission_id, item_id)): Path<(Uuid, Uuid)>,
    Form(form): Form<ReturnForm>,
) -> Result<Redirect, AppError> {
    let current_user = require_user(&cookies, &state).await?;
    let return_location_id = forms::uuid("Return location", Some(&form.return_location_id))?;
    let grade = forms::text(form.grade);

    let mut tx = state.db.begin().await?;

    // Returns of the same submission take turns, so the last one sees every
    // other item as returned and closes it.
    sqlx::query_scalar::<_, Uuid>("SELECT id FROM grading_submissions WHERE id = $1 FOR UPDATE")
        .bind(submission_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;

    let item = sqlx::query_as::<_, GradingItem>(
        "SELECT * FROM grading_items WHERE id = $1 AND submission_id = $2 FOR UPDATE",
    )
    .bind(item_id)
    .bind(submission_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(AppError::NotFound)?;

    if item.returned_at.is_some() {
        return Err(AppError::invalid_state("That card has already been returned"));
    }

    // A slab usually gets its own catalog entry; fall back to the raw card.
    let graded_product_id = forms::optional_uuid(form.graded_product_id.as_deref()).unwrap_or(item.product_id);
    let graded_cost = item.graded_cost();

    stock::receive(
        &mut tx,
        graded_product_id,
        return_location_id,
        1,
        graded_cost,
        Movement::new(MovementType::GradingReturn, current_user.id)
            .reference(submission_id)
            .reason(grade.as_deref()),
    )
    .await?;

    sqlx::query(
        r#"
        UPDATE grading_items
        SET grade = $1, graded_product_id = $2, return_location_id = $3, returned_at = NOW()
        WHERE id = $4
        "#,
    )
    .bind(&grade)
    .bind(graded_product_id)
    .bind(return_location_id)
    .bind(item_id)
    .execute(&mut *tx)
    .await?;

    let outstanding = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM grading_items WHERE submission_id = $1 AND returned_at IS NULL",
    )
    .bind(submission_id)
    .fetch_one(&mut *tx)
    .await?;

    if outstanding == 0 {
        sqlx::query("UPDATE grading_submissions SET status = 'returned', returned_at = NOW() WHERE id = $1")
            .bind(submission_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    let notice = if outstanding == 0 {
        "All cards are back. Submission closed.".to_string()
    } else {
        format!("Card returned at cost {}, {} still out", graded_cost, outstanding)
    };
    Ok(redirect_with_notice(&format!("/grading/{}", submission_id), &notice))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use sqlx::PgPool;
    use std::str::FromStr;

    use crate::test_support::{self, form as body, post, session};

    fn form(products: Vec<String>, locations: Vec<String>, fees: Vec<&str>) -> SubmissionForm {
        SubmissionForm {
            company: "PSA".into(),
            submission_number: None,
            service_level: Some("Value".into()),
            submitted_on: None,
            shipping_cost: Some("25".into()),
            notes: None,
            product_id: products,
            location_id: locations,
            grading_fee: fees.into_iter().map(String::from).collect(),
            declared_value: vec![],
        }
    }

    #[test]
    fn cards_read_fee_and_optional_value() {
        let product = Uuid::new_v4();
        let location = Uuid::new_v4();
        let cards = form(vec![product.to_string()], vec![location.to_string()], vec!["24.99"])
            .cards()
            .unwrap();
        assert_eq!(
            cards,
            vec![SubmittedCard {
                product_id: product,
                location_id: location,
                grading_fee: Decimal::from_str("24.99").unwrap(),
                declared_value: None,
            }]
        );
    }

    #[test]
    fn card_without_location_is_rejected() {
        let err = form(vec![Uuid::new_v4().to_string()], vec![String::new()], vec!["20"])
            .cards()
            .unwrap_err();
        assert_eq!(err.to_string(), "Card 1 location is required");
    }

    #[test]
    fn empty_submission_is_rejected() {
        assert!(form(vec![String::new()], vec![], vec![]).cards().is_err());
    }

    #[sqlx::test]
    async fn returns_arriving_together_close_the_submission(pool: PgPool) {
        let state = test_support::state(pool.clone());
        let owner = test_support::user(&pool, "Sam", "staff").await;
        let cookie = session(&state, owner);
        let charizard = test_support::product(&pool, "OBF-223", "Charizard ex 223/197").await;
        let pikachu = test_support::product(&pool, "PAF-131", "Pikachu 131/091").await;
        let binder = test_support::location(&pool, "Binder").await;
        let showcase = test_support::location(&pool, "Showcase").await;
        test_support::stock_up(&pool, owner, charizard, binder, 2, "50").await;
        test_support::stock_up(&pool, owner, pikachu, binder, 1, "10").await;
        let (charizard_id, pikachu_id, binder_id) = (charizard.to_string(), pikachu.to_string(), binder.to_string());
        let showcase_id = showcase.to_string();

        let submission = body(&[
            ("company", "PSA"),
            ("shipping_cost", "30"),
            ("product_id", charizard_id.as_str()),
            ("location_id", binder_id.as_str()),
            ("grading_fee", "20"),
            ("product_id", pikachu_id.as_str()),
            ("location_id", binder_id.as_str()),
            ("grading_fee", "20"),
        ]);
        assert_eq!(post(&state, Some(&cookie), "/grading", submission).await.status(), StatusCode::SEE_OTHER);
        assert_eq!(test_support::level(&pool, charizard, binder).await.quantity, 1);
        assert_eq!(test_support::level(&pool, pikachu, binder).await.quantity, 0);

        let submission_id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM grading_submissions")
            .fetch_one(&pool)
            .await
            .unwrap();
        let items = sqlx::query_scalar::<_, Uuid>("SELECT id FROM grading_items ORDER BY line_no")
            .fetch_all(&pool)
            .await
            .unwrap();

        let returns: Vec<_> = items
            .iter()
            .map(|item| {
                let (state, cookie) = (state.clone(), cookie.clone());
                let uri = format!("/grading/{}/items/{}/return", submission_id, item);
                let returned = body(&[("grade", "10"), ("return_location_id", showcase_id.as_str())]);
                tokio::spawn(async move { post(&state, Some(&cookie), &uri, returned).await.status() })
            })
            .collect();
        for returned in returns {
            assert_eq!(returned.await.unwrap(), StatusCode::SEE_OTHER);
        }

        let status = sqlx::query_scalar::<_, String>("SELECT status FROM grading_submissions WHERE id = $1")
            .bind(submission_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "returned");

        // Raw cost plus the 20.00 fee plus half of the 30.00 shipping.
        let slab = test_support::level(&pool, charizard, showcase).await;
        assert_eq!((slab.quantity, slab.average_cost), (1, test_support::dec("85")));
        let slab = test_support::level(&pool, pikachu, showcase).await;
        assert_eq!((slab.quantity, slab.average_cost), (1, test_support::dec("45")));
    }
}
