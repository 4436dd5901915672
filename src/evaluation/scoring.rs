//! Scoring: turns a settled prediction set into the frozen results summary.
//!
//! Accuracy excludes adapter-failed and parse-failed predictions from the
//! denominator entirely; they are reported as exclusions, never as
//! incorrect answers. The whole pass is a pure function of the prediction
//! set, so re-running it over unchanged rows yields an identical summary.

use serde::Serialize;

use crate::config::{ESTIMATE_INPUT_TOKENS_PER_CALL, ESTIMATE_OUTPUT_TOKENS_PER_CALL};
use crate::evaluation::normalize;
use crate::evaluation::{ConfusionMatrix, Prediction, QuestionKind, QuestionSpec, ResultsSummary};
use crate::providers::ModelRates;

pub fn summarize(
    question: &QuestionSpec,
    predictions: &[Prediction],
    total_images: i64,
) -> ResultsSummary {
    let mut summary = ResultsSummary {
        total_images,
        processed: predictions.len() as i64,
        successful: 0,
        correct: 0,
        adapter_failures: 0,
        parse_failures: 0,
        missing_ground_truth: 0,
        accuracy: None,
        confusion: None,
        tokens_used: 0,
        actual_cost: 0.0,
    };
    let mut confusion = ConfusionMatrix {
        true_positives: 0,
        true_negatives: 0,
        false_positives: 0,
        false_negatives: 0,
    };

    for pred in predictions {
        // Cost rolls up across every prediction, including failed ones:
        // tokens spent on a chain that later died were still spent.
        summary.tokens_used += pred.tokens_used.unwrap_or(0) as i64;
        summary.actual_cost += pred.cost.unwrap_or(0.0);

        if pred.error.is_some() {
            summary.adapter_failures += 1;
            continue;
        }
        let Some(answer) = &pred.parsed_answer else {
            summary.parse_failures += 1;
            continue;
        };
        let Some(is_correct) = pred.is_correct else {
            summary.missing_ground_truth += 1;
            continue;
        };

        summary.successful += 1;
        if is_correct {
            summary.correct += 1;
        }

        if question.kind == QuestionKind::Binary {
            let gt_bool = pred
                .ground_truth
                .as_deref()
                .and_then(normalize::parse_binary_token);
            if let (Some(gt), Some(answered)) = (gt_bool, answer.as_bool()) {
                // Ground-truth true is the positive class.
                match (gt, answered) {
                    (true, true) => confusion.true_positives += 1,
                    (false, false) => confusion.true_negatives += 1,
                    (false, true) => confusion.false_positives += 1,
                    (true, false) => confusion.false_negatives += 1,
                }
            }
        }
    }

    if summary.successful > 0 {
        summary.accuracy = Some(100.0 * summary.correct as f64 / summary.successful as f64);
    }
    if question.kind == QuestionKind::Binary {
        summary.confusion = Some(confusion);
    }
    summary
}

// ============================================================================
// Cost estimation
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub estimated_cost: f64,
    pub image_count: i64,
    pub avg_cost_per_image: f64,
}

/// Pre-run estimate from published rates and a rough per-call token shape;
/// every chain step is one adapter call, so cost scales with chain length.
/// No provider is contacted.
pub fn estimate_cost(image_count: i64, chain_len: usize, rates: ModelRates) -> CostEstimate {
    let calls = image_count.max(0) as u64 * chain_len as u64;
    let input_tokens = calls * ESTIMATE_INPUT_TOKENS_PER_CALL;
    let output_tokens = calls * ESTIMATE_OUTPUT_TOKENS_PER_CALL;
    let estimated_cost = rates.cost(input_tokens, output_tokens);
    let avg_cost_per_image = if image_count > 0 {
        estimated_cost / image_count as f64
    } else {
        0.0
    };
    CostEstimate {
        estimated_cost,
        image_count,
        avg_cost_per_image,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::ParsedAnswer;

    fn binary_question() -> QuestionSpec {
        QuestionSpec {
            kind: QuestionKind::Binary,
            options: vec![],
        }
    }

    fn scored(image_id: &str, answer: ParsedAnswer, ground_truth: &str, correct: bool) -> Prediction {
        Prediction {
            id: 0,
            job_id: "j".to_string(),
            image_id: image_id.to_string(),
            step_results: vec![],
            parsed_answer: Some(answer),
            ground_truth: Some(ground_truth.to_string()),
            is_correct: Some(correct),
            error: None,
            latency_ms: 100,
            tokens_used: Some(1000),
            cost: Some(0.001),
            created_at: String::new(),
        }
    }

    fn adapter_failed(image_id: &str, ground_truth: &str) -> Prediction {
        Prediction {
            id: 0,
            job_id: "j".to_string(),
            image_id: image_id.to_string(),
            step_results: vec![],
            parsed_answer: None,
            ground_truth: Some(ground_truth.to_string()),
            is_correct: None,
            error: Some("transient provider error: boom".to_string()),
            latency_ms: 50,
            tokens_used: Some(200),
            cost: Some(0.0002),
            created_at: String::new(),
        }
    }

    fn parse_failed(image_id: &str, ground_truth: &str) -> Prediction {
        Prediction {
            parsed_answer: None,
            error: None,
            ..adapter_failed(image_id, ground_truth)
        }
    }

    #[test]
    fn binary_example_with_one_adapter_failure() {
        // 4 images, truths [true, true, false, false]; the model answers 3
        // of them [true, false, false] and the last image's adapter fails.
        let preds = vec![
            scored("img1", ParsedAnswer::Binary(true), "true", true),
            scored("img2", ParsedAnswer::Binary(false), "true", false),
            scored("img3", ParsedAnswer::Binary(false), "false", true),
            adapter_failed("img4", "false"),
        ];
        let summary = summarize(&binary_question(), &preds, 4);

        assert_eq!(summary.processed, 4);
        assert_eq!(summary.successful, 3);
        assert_eq!(summary.correct, 2);
        assert_eq!(summary.adapter_failures, 1);
        let accuracy = summary.accuracy.unwrap();
        assert!((accuracy - 200.0 / 3.0).abs() < 1e-9, "accuracy: {accuracy}");

        let m = summary.confusion.unwrap();
        assert_eq!(m.true_positives, 1);
        assert_eq!(m.false_negatives, 1);
        assert_eq!(m.true_negatives, 1);
        assert_eq!(m.false_positives, 0);
        // Excluded predictions never enter the matrix.
        assert_eq!(
            m.true_positives + m.true_negatives + m.false_positives + m.false_negatives,
            summary.successful
        );
    }

    #[test]
    fn parse_failures_are_excluded_not_incorrect() {
        let preds = vec![
            scored("a", ParsedAnswer::Binary(true), "yes", true),
            parse_failed("b", "yes"),
        ];
        let summary = summarize(&binary_question(), &preds, 2);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.parse_failures, 1);
        assert_eq!(summary.accuracy, Some(100.0));
    }

    #[test]
    fn missing_ground_truth_is_tracked_separately() {
        let mut pred = scored("a", ParsedAnswer::Binary(true), "yes", true);
        pred.is_correct = None;
        let summary = summarize(&binary_question(), &[pred], 1);
        assert_eq!(summary.successful, 0);
        assert_eq!(summary.missing_ground_truth, 1);
        assert_eq!(summary.accuracy, None);
    }

    #[test]
    fn non_binary_questions_have_no_confusion_matrix() {
        let question = QuestionSpec {
            kind: QuestionKind::Count,
            options: vec![],
        };
        let preds = vec![scored("a", ParsedAnswer::Count(3), "3", true)];
        let summary = summarize(&question, &preds, 1);
        assert!(summary.confusion.is_none());
        assert_eq!(summary.accuracy, Some(100.0));
    }

    #[test]
    fn cost_rolls_up_across_failed_predictions_too() {
        let preds = vec![
            scored("a", ParsedAnswer::Binary(true), "yes", true),
            adapter_failed("b", "no"),
        ];
        let summary = summarize(&binary_question(), &preds, 2);
        assert_eq!(summary.tokens_used, 1200);
        assert!((summary.actual_cost - 0.0012).abs() < 1e-12);
    }

    #[test]
    fn summarize_is_idempotent() {
        let preds = vec![
            scored("a", ParsedAnswer::Binary(true), "yes", true),
            scored("b", ParsedAnswer::Binary(false), "yes", false),
            adapter_failed("c", "no"),
        ];
        let first = summarize(&binary_question(), &preds, 3);
        let second = summarize(&binary_question(), &preds, 3);
        assert_eq!(first, second);
    }

    #[test]
    fn estimate_scales_with_images_and_chain_length() {
        let rates = ModelRates {
            input_per_million: 1.0,
            output_per_million: 10.0,
        };
        let estimate = estimate_cost(4, 2, rates);
        // 8 calls at the fixed per-call token shape.
        let calls = 8u64;
        let expected = rates.cost(
            calls * ESTIMATE_INPUT_TOKENS_PER_CALL,
            calls * ESTIMATE_OUTPUT_TOKENS_PER_CALL,
        );
        assert!((estimate.estimated_cost - expected).abs() < 1e-12);
        assert_eq!(estimate.image_count, 4);
        assert!((estimate.avg_cost_per_image - expected / 4.0).abs() < 1e-12);

        let single = estimate_cost(4, 1, rates);
        assert!(estimate.estimated_cost > single.estimated_cost);
    }

    #[test]
    fn empty_dataset_estimates_to_zero() {
        let rates = ModelRates {
            input_per_million: 1.0,
            output_per_million: 1.0,
        };
        let estimate = estimate_cost(0, 3, rates);
        assert_eq!(estimate.estimated_cost, 0.0);
        assert_eq!(estimate.avg_cost_per_image, 0.0);
    }
}
