//! Per-image dispatch: one image's prompt chain, run sequentially.
//!
//! Steps within an image never parallelize (step k needs step k-1's raw
//! output); every adapter call is wrapped in the retry policy. Whatever
//! happens, the image settles into exactly one Prediction: a step that
//! exhausts retries stops the chain and records the partial step results
//! with `error` set.

use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::config::{RETRY_BACKOFF_SECS, RETRY_MAX_ATTEMPTS};
use crate::dataset::DatasetItem;
use crate::evaluation::chain;
use crate::evaluation::normalize;
use crate::evaluation::{Prediction, PromptStep, QuestionSpec, StepResult};
use crate::providers::{AdapterError, AdapterResponse, ModelAdapter};

pub async fn evaluate_image(
    adapter: &dyn ModelAdapter,
    question: &QuestionSpec,
    prompt_chain: &[PromptStep],
    job_id: &str,
    item: &DatasetItem,
) -> Prediction {
    let mut step_results: Vec<StepResult> = Vec::with_capacity(prompt_chain.len());
    let mut chain_error: Option<String> = None;
    let mut total_latency: u64 = 0;
    let mut total_tokens: Option<u64> = None;
    let mut total_cost: Option<f64> = None;

    for step in prompt_chain {
        let rendered = chain::render_step(step, &step_results);
        for warning in &rendered.warnings {
            warn!(job_id, image_id = %item.image_id, "{warning}");
        }

        let started = Instant::now();
        let outcome = call_with_retry(
            adapter,
            rendered.system_message.as_deref(),
            &rendered.prompt,
            &item.image,
        )
        .await;

        match outcome {
            Ok(resp) => {
                total_latency += resp.latency_ms;
                if let Some(tokens) = resp.tokens_used() {
                    *total_tokens.get_or_insert(0) += tokens;
                }
                if let Some(cost) = resp.cost {
                    *total_cost.get_or_insert(0.0) += cost;
                }
                step_results.push(StepResult {
                    step_number: step.step_number,
                    tokens_used: resp.tokens_used(),
                    raw_text: Some(resp.text),
                    latency_ms: resp.latency_ms,
                    error: None,
                });
            }
            Err(e) => {
                // Failed steps report wall time across all attempts; there
                // is no single provider latency to attribute.
                let wall_ms = started.elapsed().as_millis() as u64;
                total_latency += wall_ms;
                step_results.push(StepResult {
                    step_number: step.step_number,
                    raw_text: None,
                    latency_ms: wall_ms,
                    tokens_used: None,
                    error: Some(e.to_string()),
                });
                chain_error = Some(format!("step {} failed ({}): {e}", step.step_number, e.kind()));
                break;
            }
        }
    }

    let mut parsed_answer = None;
    let mut is_correct = None;
    if chain_error.is_none() {
        let final_raw = step_results
            .last()
            .and_then(|r| r.raw_text.as_deref())
            .unwrap_or("");
        match normalize::parse_answer(question, final_raw) {
            Ok(answer) => {
                is_correct = item
                    .ground_truth
                    .as_deref()
                    .and_then(|gt| normalize::compare(question, &answer, gt));
                parsed_answer = Some(answer);
            }
            Err(e) => {
                debug!(job_id, image_id = %item.image_id, "answer parse failed: {e}");
            }
        }
    }

    Prediction {
        id: 0,
        job_id: job_id.to_string(),
        image_id: item.image_id.clone(),
        step_results,
        parsed_answer,
        ground_truth: item.ground_truth.clone(),
        is_correct,
        error: chain_error,
        latency_ms: total_latency,
        tokens_used: total_tokens,
        cost: total_cost,
        created_at: Utc::now().to_rfc3339(),
    }
}

/// Up to RETRY_MAX_ATTEMPTS calls; only retryable errors earn another
/// attempt, with the backoff schedule slept in between. A success on any
/// attempt short-circuits.
pub(crate) async fn call_with_retry(
    adapter: &dyn ModelAdapter,
    system_message: Option<&str>,
    prompt: &str,
    image: &Bytes,
) -> Result<AdapterResponse, AdapterError> {
    let mut attempt: u32 = 1;
    loop {
        match adapter.invoke(system_message, prompt, image).await {
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_retryable() && attempt < RETRY_MAX_ATTEMPTS => {
                let idx = (attempt as usize - 1).min(RETRY_BACKOFF_SECS.len() - 1);
                let delay_secs = RETRY_BACKOFF_SECS[idx];
                warn!(
                    attempt,
                    delay_secs,
                    kind = e.kind(),
                    "adapter call failed, retrying: {e}"
                );
                sleep(Duration::from_secs(delay_secs)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
