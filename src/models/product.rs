use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

pub const PRODUCT_TYPES: [&str; 5] = ["sealed", "single", "graded", "supply", "other"];

pub const GRADING_COMPANIES: [&str; 5] = ["PSA", "BGS", "CGC", "SGC", "Other"];

pub fn is_product_type(value: &str) -> bool {
    PRODUCT_TYPES.contains(&value)
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub sku: String,
    pub game: Option<String>,
    pub set_name: Option<String>,
    pub product_type: String,
    pub language: Option<String>,
    pub condition: Option<String>,
    pub grading_company: Option<String>,
    pub grade: Option<String>,
    pub market_price: Option<Decimal>,
    pub notes: Option<String>,
    pub is_active: bool,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Accessors used by the templates, which cannot unwrap options inline.
impl Product {
    pub fn game_text(&self) -> &str {
        self.game.as_deref().unwrap_or("")
    }

    pub fn set_text(&self) -> &str {
        self.set_name.as_deref().unwrap_or("")
    }

    pub fn language_text(&self) -> &str {
        self.language.as_deref().unwrap_or("")
    }

    pub fn condition_text(&self) -> &str {
        self.condition.as_deref().unwrap_or("")
    }

    pub fn grading_company_text(&self) -> &str {
        self.grading_company.as_deref().unwrap_or("")
    }

    pub fn grade_text(&self) -> &str {
        self.grade.as_deref().unwrap_or("")
    }

    pub fn notes_text(&self) -> &str {
        self.notes.as_deref().unwrap_or("")
    }

    pub fn market_price_text(&self) -> String {
        self.market_price.map(|p| format!("{:.2}", p)).unwrap_or_default()
    }

    /// Label for pick lists: "Name (SKU)" plus the grade for slabs.
    pub fn label(&self) -> String {
        match (&self.grading_company, &self.grade) {
            (Some(company), Some(grade)) => format!("{} {} {} ({})", self.name, company, grade, self.sku),
            _ => format!("{} ({})", self.name, self.sku),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> Product {
        Product {
            id: Uuid::nil(),
            name: "Charizard".into(),
            sku: "BS-004".into(),
            game: Some("Pokemon".into()),
            set_name: Some("Base Set".into()),
            product_type: "single".into(),
            language: None,
            condition: None,
            grading_company: None,
            grade: None,
            market_price: Some(Decimal::new(35000, 2)),
            notes: None,
            is_active: true,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn label_includes_grade_for_slabs() {
        let mut p = product();
        assert_eq!(p.label(), "Charizard (BS-004)");
        p.grading_company = Some("PSA".into());
        p.grade = Some("9".into());
        assert_eq!(p.label(), "Charizard PSA 9 (BS-004)");
    }

    #[test]
    fn market_price_renders_with_cents() {
        let mut p = product();
        assert_eq!(p.market_price_text(), "350.00");
        p.market_price = None;
        assert_eq!(p.market_price_text(), "");
    }

    #[test]
    fn known_product_types() {
        assert!(is_product_type("sealed"));
        assert!(!is_product_type("booster"));
    }
}
