use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use chrono::{DateTime, Utc};

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct Stream {
    pub id: Uuid,
    pub title: String,
    pub platform: String,
    pub location_id: Uuid,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
}

impl Stream {
    pub fn started_at_text(&self) -> String {
        self.started_at.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[derive(Debug, Serialize, FromRow)]
pub struct StreamSummary {
    pub id: Uuid,
    pub title: String,
    pub platform: String,
    pub location_name: String,
    pub status: String,
    pub product_count: i64,
    pub started_at: DateTime<Utc>,
}

impl StreamSummary {
    pub fn started_at_text(&self) -> String {
        self.started_at.format("%Y-%m-%d %H:%M").to_string()
    }
}

/// One product's counts for a stream, with the units sold on it.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StreamLine {
    pub product_id: Uuid,
    pub product_name: String,
    pub system_start: i32,
    pub start_count: i32,
    pub end_count: Option<i32>,
    pub sold: i64,
}

impl StreamLine {
    pub fn expected_end(&self) -> i64 {
        i64::from(self.start_count) - self.sold
    }

    /// Counted minus expected at the end; `None` until counted.
    pub fn end_discrepancy(&self) -> Option<i64> {
        self.end_count.map(|end| i64::from(end) - self.expected_end())
    }

    /// Counted minus system quantity when the stream began.
    pub fn start_discrepancy(&self) -> i64 {
        i64::from(self.start_count) - i64::from(self.system_start)
    }

    pub fn has_discrepancy(&self) -> bool {
        self.start_discrepancy() != 0 || self.end_discrepancy().map_or(false, |d| d != 0)
    }

    pub fn end_count_text(&self) -> String {
        self.end_count.map(|c| c.to_string()).unwrap_or_default()
    }
}

/// Totals across a stream for the summary box.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StreamReconciliation {
    pub lines_with_discrepancy: usize,
    pub units_missing: i64,
    pub units_extra: i64,
}

impl StreamReconciliation {
    pub fn from_lines(lines: &[StreamLine]) -> Self {
        let mut summary = Self::default();
        for line in lines {
            if line.has_discrepancy() {
                summary.lines_with_discrepancy += 1;
            }
            match line.end_discrepancy() {
                Some(d) if d < 0 => summary.units_missing += -d,
                Some(d) if d > 0 => summary.units_extra += d,
                _ => {}
            }
        }
        summary
    }

    pub fn is_clean(&self) -> bool {
        self.lines_with_discrepancy == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(system_start: i32, start: i32, end: Option<i32>, sold: i64) -> StreamLine {
        StreamLine {
            product_id: Uuid::new_v4(),
            product_name: "Obsidian Flames Booster".into(),
            system_start,
            start_count: start,
            end_count: end,
            sold,
        }
    }

    #[test]
    fn clean_stream_has_no_discrepancy() {
        let l = line(36, 36, Some(30), 6);
        assert_eq!(l.expected_end(), 30);
        assert_eq!(l.end_discrepancy(), Some(0));
        assert!(!l.has_discrepancy());
    }

    #[test]
    fn missing_packs_show_as_negative() {
        let l = line(36, 36, Some(28), 6);
        assert_eq!(l.end_discrepancy(), Some(-2));
        assert!(l.has_discrepancy());
    }

    #[test]
    fn unlogged_returns_show_as_positive() {
        let l = line(10, 10, Some(9), 2);
        assert_eq!(l.end_discrepancy(), Some(1));
    }

    #[test]
    fn start_count_mismatch_is_flagged_before_end() {
        let l = line(12, 10, None, 0);
        assert_eq!(l.end_discrepancy(), None);
        assert_eq!(l.start_discrepancy(), -2);
        assert!(l.has_discrepancy());
        assert_eq!(l.end_count_text(), "");
    }

    #[test]
    fn summary_totals_missing_and_extra_units() {
        let lines = vec![
            line(36, 36, Some(28), 6),
            line(10, 10, Some(9), 2),
            line(5, 5, Some(5), 0),
        ];
        let summary = StreamReconciliation::from_lines(&lines);
        assert_eq!(
            summary,
            StreamReconciliation {
                lines_with_discrepancy: 2,
                units_missing: 2,
                units_extra: 1,
            }
        );
        assert!(!summary.is_clean());
    }
}
