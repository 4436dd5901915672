pub mod chain;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod normalize;
pub mod progress;
pub mod queries;
pub mod scoring;

use serde::{Deserialize, Serialize};

use crate::providers::ModelConfig;

// ============================================================================
// Shared data model structs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition again; their rows are frozen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Binary,
    MultipleChoice,
    Text,
    Count,
}

impl QuestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::Binary => "binary",
            QuestionKind::MultipleChoice => "multiple_choice",
            QuestionKind::Text => "text",
            QuestionKind::Count => "count",
        }
    }
}

/// The question a dataset asks of every image, as declared in its manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionSpec {
    pub kind: QuestionKind,
    /// Allowed answers for `multiple_choice`; empty for other kinds.
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptStep {
    pub step_number: u32,
    /// Defaults to step 1's system message when omitted on later steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    pub prompt: String,
}

/// Outcome of one prompt step for one image. `raw_text` is None when the
/// step's adapter call failed after retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_number: u32,
    pub raw_text: Option<String>,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParsedAnswer {
    Binary(bool),
    Choice(String),
    Text(String),
    Count(i64),
}

impl ParsedAnswer {
    /// Canonical string form stored in the predictions table. Binary answers
    /// collapse to "true"/"false" so result filters stay plain SQL.
    pub fn canonical(&self) -> String {
        match self {
            ParsedAnswer::Binary(b) => b.to_string(),
            ParsedAnswer::Choice(s) => s.clone(),
            ParsedAnswer::Text(s) => s.clone(),
            ParsedAnswer::Count(n) => n.to_string(),
        }
    }

    /// Rebuilds the typed answer from its canonical form, given the question
    /// kind the job was created with.
    pub fn from_canonical(kind: QuestionKind, s: &str) -> Option<ParsedAnswer> {
        match kind {
            QuestionKind::Binary => match s {
                "true" => Some(ParsedAnswer::Binary(true)),
                "false" => Some(ParsedAnswer::Binary(false)),
                _ => None,
            },
            QuestionKind::MultipleChoice => Some(ParsedAnswer::Choice(s.to_string())),
            QuestionKind::Text => Some(ParsedAnswer::Text(s.to_string())),
            QuestionKind::Count => s.parse::<i64>().ok().map(ParsedAnswer::Count),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParsedAnswer::Binary(b) => Some(*b),
            _ => None,
        }
    }
}

/// One image's record within a job. Written exactly once, after the image's
/// chain settles; adapter failures leave `error` set and `parsed_answer` None.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: i64,
    pub job_id: String,
    pub image_id: String,
    pub step_results: Vec<StepResult>,
    pub parsed_answer: Option<ParsedAnswer>,
    pub ground_truth: Option<String>,
    /// None when the image is excluded from scoring (adapter failure, parse
    /// failure, or unusable ground truth).
    pub is_correct: Option<bool>,
    pub error: Option<String>,
    pub latency_ms: u64,
    pub tokens_used: Option<u64>,
    pub cost: Option<f64>,
    pub created_at: String,
}

impl Prediction {
    pub fn adapter_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    #[serde(rename = "tp")]
    pub true_positives: i64,
    #[serde(rename = "tn")]
    pub true_negatives: i64,
    #[serde(rename = "fp")]
    pub false_positives: i64,
    #[serde(rename = "fn")]
    pub false_negatives: i64,
}

/// Frozen output of the scoring pass, stored verbatim on the job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub total_images: i64,
    pub processed: i64,
    /// Predictions that produced a usable, compared answer.
    pub successful: i64,
    pub correct: i64,
    pub adapter_failures: i64,
    pub parse_failures: i64,
    pub missing_ground_truth: i64,
    /// 100 × correct / successful; None when nothing scored.
    pub accuracy: Option<f64>,
    /// Binary questions only.
    pub confusion: Option<ConfusionMatrix>,
    pub tokens_used: i64,
    pub actual_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationJob {
    pub id: String,
    pub dataset_id: String,
    pub question: QuestionSpec,
    pub model_config: ModelConfig,
    pub prompt_chain: Vec<PromptStep>,
    pub status: JobStatus,
    pub total_images: i64,
    pub processed_images: i64,
    pub accuracy: Option<f64>,
    pub results_summary: Option<ResultsSummary>,
    pub estimated_cost: Option<f64>,
    pub actual_cost: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl EvaluationJob {
    pub fn new(
        dataset_id: String,
        question: QuestionSpec,
        model_config: ModelConfig,
        prompt_chain: Vec<PromptStep>,
        total_images: i64,
        estimated_cost: f64,
    ) -> Self {
        EvaluationJob {
            id: uuid::Uuid::new_v4().to_string(),
            dataset_id,
            question,
            model_config,
            prompt_chain,
            status: JobStatus::Pending,
            total_images,
            processed_images: 0,
            accuracy: None,
            results_summary: None,
            estimated_cost: Some(estimated_cost),
            actual_cost: None,
            error_message: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            started_at: None,
            completed_at: None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("paused"), None);
    }

    #[test]
    fn terminal_states_are_exactly_the_three_end_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn binary_canonical_form_is_sql_filterable() {
        assert_eq!(ParsedAnswer::Binary(true).canonical(), "true");
        assert_eq!(ParsedAnswer::Binary(false).canonical(), "false");
        assert_eq!(
            ParsedAnswer::from_canonical(QuestionKind::Binary, "true"),
            Some(ParsedAnswer::Binary(true))
        );
        assert_eq!(ParsedAnswer::from_canonical(QuestionKind::Binary, "yes"), None);
    }

    #[test]
    fn count_canonical_form_round_trips() {
        let answer = ParsedAnswer::Count(12);
        assert_eq!(answer.canonical(), "12");
        assert_eq!(
            ParsedAnswer::from_canonical(QuestionKind::Count, "12"),
            Some(answer)
        );
    }

    #[test]
    fn confusion_matrix_serializes_with_short_keys() {
        let m = ConfusionMatrix {
            true_positives: 1,
            true_negatives: 2,
            false_positives: 0,
            false_negatives: 1,
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["tp"], 1);
        assert_eq!(v["tn"], 2);
        assert_eq!(v["fp"], 0);
        assert_eq!(v["fn"], 1);
    }
}
