//! Read-side queries: job listings and filtered, paged prediction reads.
//!
//! Writers live in `db.rs`; everything here is a pure read over the same
//! connection, shaped for the HTTP handlers.

use rusqlite::params;
use serde::Serialize;

use super::db::{prediction_from_row, EvalDb};
use super::{JobStatus, Prediction, QuestionKind};
use crate::providers::{ModelConfig, ProviderKind};

/// Result filter for the predictions listing. The confusion-cell filters
/// only make sense for binary questions; handlers reject them elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFilter {
    All,
    Correct,
    Incorrect,
    TruePositive,
    TrueNegative,
    FalsePositive,
    FalseNegative,
}

impl ResultFilter {
    pub fn parse(s: &str) -> Option<ResultFilter> {
        match s {
            "all" => Some(ResultFilter::All),
            "correct" => Some(ResultFilter::Correct),
            "incorrect" => Some(ResultFilter::Incorrect),
            "tp" => Some(ResultFilter::TruePositive),
            "tn" => Some(ResultFilter::TrueNegative),
            "fp" => Some(ResultFilter::FalsePositive),
            "fn" => Some(ResultFilter::FalseNegative),
            _ => None,
        }
    }

    pub fn requires_binary(&self) -> bool {
        matches!(
            self,
            ResultFilter::TruePositive
                | ResultFilter::TrueNegative
                | ResultFilter::FalsePositive
                | ResultFilter::FalseNegative
        )
    }

    /// Binary answers are stored canonically as "true"/"false", so every
    /// confusion cell is expressible over (is_correct, parsed_answer):
    /// a correct "true" is a true positive, an incorrect "false" is a
    /// false negative, and so on.
    fn where_clause(&self) -> &'static str {
        match self {
            ResultFilter::All => "",
            ResultFilter::Correct => " AND is_correct=1",
            ResultFilter::Incorrect => " AND is_correct=0",
            ResultFilter::TruePositive => " AND is_correct=1 AND parsed_answer='true'",
            ResultFilter::TrueNegative => " AND is_correct=1 AND parsed_answer='false'",
            ResultFilter::FalsePositive => " AND is_correct=0 AND parsed_answer='true'",
            ResultFilter::FalseNegative => " AND is_correct=0 AND parsed_answer='false'",
        }
    }
}

/// One page of predictions for a job, most recently inserted last.
pub fn list_predictions(
    db: &EvalDb,
    job_id: &str,
    kind: QuestionKind,
    filter: ResultFilter,
    offset: i64,
    limit: i64,
) -> anyhow::Result<Vec<Prediction>> {
    let conn = db.conn();
    let sql = format!(
        "SELECT id, job_id, image_id, step_results_json, parsed_answer, ground_truth,
                is_correct, error, latency_ms, tokens_used, cost, created_at
         FROM predictions WHERE job_id=?1{} ORDER BY id LIMIT ?2 OFFSET ?3",
        filter.where_clause()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![job_id, limit.max(0), offset.max(0)], |row| {
        prediction_from_row(row, kind)
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// Lightweight job row for the listing endpoint; skips the chain and
/// summary JSON columns.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummaryRow {
    pub id: String,
    pub dataset_id: String,
    pub provider: ProviderKind,
    pub model_name: String,
    pub status: JobStatus,
    pub total_images: i64,
    pub processed_images: i64,
    pub accuracy: Option<f64>,
    pub estimated_cost: Option<f64>,
    pub actual_cost: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// List all jobs, most recent first.
pub fn list_jobs(db: &EvalDb) -> anyhow::Result<Vec<JobSummaryRow>> {
    let conn = db.conn();
    let mut stmt = conn.prepare(
        "SELECT id, dataset_id, model_config_json, status, total_images, processed_images,
                accuracy, estimated_cost, actual_cost, error_message, created_at, completed_at
         FROM jobs ORDER BY created_at DESC, id",
    )?;
    let rows = stmt.query_map([], |row| {
        let model_json: String = row.get(2)?;
        let model: ModelConfig = serde_json::from_str(&model_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let status_raw: String = row.get(3)?;
        let status = JobStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown job status {status_raw:?}").into(),
            )
        })?;
        Ok(JobSummaryRow {
            id: row.get(0)?,
            dataset_id: row.get(1)?,
            provider: model.provider,
            model_name: model.model_name,
            status,
            total_images: row.get(4)?,
            processed_images: row.get(5)?,
            accuracy: row.get(6)?,
            estimated_cost: row.get(7)?,
            actual_cost: row.get(8)?,
            error_message: row.get(9)?,
            created_at: row.get(10)?,
            completed_at: row.get(11)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_names_parse() {
        assert_eq!(ResultFilter::parse("all"), Some(ResultFilter::All));
        assert_eq!(ResultFilter::parse("correct"), Some(ResultFilter::Correct));
        assert_eq!(ResultFilter::parse("incorrect"), Some(ResultFilter::Incorrect));
        assert_eq!(ResultFilter::parse("tp"), Some(ResultFilter::TruePositive));
        assert_eq!(ResultFilter::parse("tn"), Some(ResultFilter::TrueNegative));
        assert_eq!(ResultFilter::parse("fp"), Some(ResultFilter::FalsePositive));
        assert_eq!(ResultFilter::parse("fn"), Some(ResultFilter::FalseNegative));
        assert_eq!(ResultFilter::parse("wrong"), None);
        assert_eq!(ResultFilter::parse("FN"), None);
    }

    #[test]
    fn only_confusion_cells_require_binary() {
        assert!(!ResultFilter::All.requires_binary());
        assert!(!ResultFilter::Correct.requires_binary());
        assert!(!ResultFilter::Incorrect.requires_binary());
        assert!(ResultFilter::TruePositive.requires_binary());
        assert!(ResultFilter::TrueNegative.requires_binary());
        assert!(ResultFilter::FalsePositive.requires_binary());
        assert!(ResultFilter::FalseNegative.requires_binary());
    }
}
