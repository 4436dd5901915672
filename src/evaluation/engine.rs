use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use super::dispatch;
use super::progress::JobProgress;
use super::scoring;
use super::{EvaluationJob, JobStatus};
use crate::config::ADAPTER_FAILURE_ABORT_RATIO;
use crate::providers::ModelAdapter;
use crate::state::{JobHandle, SharedState};

/// Raised when a run's adapter-failure fraction crosses the abort threshold.
/// Individual adapter failures only degrade their own prediction; this is
/// the one aggregate condition that fails the whole job.
#[derive(Debug, thiserror::Error)]
#[error("adapter failures on {failures} of {processed} images exceeded the {}% abort threshold", .threshold * 100.0)]
pub struct JobAbortError {
    pub failures: i64,
    pub processed: i64,
    pub threshold: f64,
}

/// Registers the job in the in-memory registry and detaches the worker.
/// The worker owns the job from here on; the only external influence left
/// is the cancel signal.
pub async fn spawn_job(state: SharedState, job: EvaluationJob, adapter: Arc<dyn ModelAdapter>) {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    state
        .jobs
        .write()
        .await
        .insert(job.id.clone(), JobHandle { cancel_tx });
    tokio::spawn(run_job(state.clone(), job, adapter, cancel_rx));
}

/// Drives one evaluation job to a terminal state.
pub async fn run_job(
    state: SharedState,
    job: EvaluationJob,
    adapter: Arc<dyn ModelAdapter>,
    cancel_rx: watch::Receiver<bool>,
) {
    let job_id = job.id.clone();
    execute(&state, &job, adapter, cancel_rx).await;
    state.jobs.write().await.remove(&job_id);
}

async fn execute(
    state: &SharedState,
    job: &EvaluationJob,
    adapter: Arc<dyn ModelAdapter>,
    cancel_rx: watch::Receiver<bool>,
) {
    let db = state.db.clone();
    info!(
        job_id = %job.id,
        dataset_id = %job.dataset_id,
        model = %job.model_config.model_name,
        steps = job.prompt_chain.len(),
        "evaluation job starting"
    );

    let snapshot = match state.datasets.load(&job.dataset_id).await {
        Ok(s) => s,
        Err(e) => {
            error!(job_id = %job.id, "dataset load failed: {e}");
            let summary = scoring::summarize(&job.question, &[], job.total_images);
            let message = format!("dataset load failed: {e}");
            if let Err(e) = db.complete_job(&job.id, JobStatus::Failed, &summary, Some(&message)) {
                error!(job_id = %job.id, "failed to record job failure: {e}");
            }
            return;
        }
    };

    let total = snapshot.items.len() as i64;
    match db.mark_running(&job.id, total) {
        Ok(true) => {}
        Ok(false) => {
            // Engine is the sole status writer, so this means the row is
            // gone or was tampered with; do not run against it.
            warn!(job_id = %job.id, "job is not pending; refusing to run");
            return;
        }
        Err(e) => {
            error!(job_id = %job.id, "failed to mark job running: {e}");
            return;
        }
    }

    let progress = Arc::new(JobProgress::new(total as u64));
    let semaphore = Arc::new(Semaphore::new(job.model_config.effective_concurrency()));
    let question = Arc::new(job.question.clone());
    let chain = Arc::new(job.prompt_chain.clone());

    let mut cancelled = false;
    let mut handles = Vec::with_capacity(snapshot.items.len());
    for item in snapshot.items {
        // Cancel stops enqueuing; images already dispatched run to their
        // single Prediction so every dispatched image has exactly one
        // outcome. Checked again after the permit wait because that is
        // where this loop parks.
        if *cancel_rx.borrow() {
            cancelled = true;
            break;
        }
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        if *cancel_rx.borrow() {
            cancelled = true;
            break;
        }

        let db = db.clone();
        let adapter = adapter.clone();
        let question = question.clone();
        let chain = chain.clone();
        let progress = progress.clone();
        let job_id = job.id.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            let pred =
                dispatch::evaluate_image(adapter.as_ref(), &question, &chain, &job_id, &item).await;
            let processed = if pred.adapter_failed() {
                progress.record_failure()
            } else {
                progress.record_success()
            };
            if let Err(e) = db.insert_prediction(&pred) {
                error!(job_id, image_id = %pred.image_id, "failed to persist prediction: {e}");
            }
            if let Err(e) = db.update_progress(&job_id, processed as i64) {
                warn!(job_id, "failed to update progress: {e}");
            }
        }));
    }

    if cancelled {
        info!(
            job_id = %job.id,
            in_flight = handles.len(),
            "cancel requested; waiting for in-flight images"
        );
    }
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!(job_id = %job.id, "image task panicked: {e}");
        }
    }

    // Score over what was actually persisted, not over in-memory tallies:
    // a prediction that failed to insert should not count.
    let predictions = match db.predictions_for_job(&job.id, job.question.kind) {
        Ok(p) => p,
        Err(e) => {
            error!(job_id = %job.id, "failed to read predictions for scoring: {e}");
            Vec::new()
        }
    };
    let summary = scoring::summarize(&job.question, &predictions, total);

    let (status, error_message) = if cancelled {
        (
            JobStatus::Cancelled,
            Some("cancelled before all images were dispatched".to_string()),
        )
    } else if exceeds_abort_threshold(summary.adapter_failures, summary.processed) {
        let abort = JobAbortError {
            failures: summary.adapter_failures,
            processed: summary.processed,
            threshold: ADAPTER_FAILURE_ABORT_RATIO,
        };
        (JobStatus::Failed, Some(abort.to_string()))
    } else {
        (JobStatus::Completed, None)
    };

    match db.complete_job(&job.id, status, &summary, error_message.as_deref()) {
        Ok(true) => info!(
            job_id = %job.id,
            status = status.as_str(),
            accuracy = ?summary.accuracy,
            cost = summary.actual_cost,
            "evaluation job finished"
        ),
        Ok(false) => warn!(job_id = %job.id, "job already terminal; summary not overwritten"),
        Err(e) => error!(job_id = %job.id, "failed to finalize job: {e}"),
    }
}

/// Strictly greater than the threshold: a run at exactly the boundary
/// still completes.
fn exceeds_abort_threshold(failures: i64, processed: i64) -> bool {
    processed > 0 && failures as f64 / processed as f64 > ADAPTER_FAILURE_ABORT_RATIO
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_needs_a_strict_majority_of_failures() {
        assert!(!exceeds_abort_threshold(0, 0));
        assert!(!exceeds_abort_threshold(2, 4));
        assert!(exceeds_abort_threshold(3, 4));
        assert!(exceeds_abort_threshold(1, 1));
    }

    #[test]
    fn abort_error_message_names_the_numbers() {
        let e = JobAbortError {
            failures: 3,
            processed: 4,
            threshold: 0.5,
        };
        let msg = e.to_string();
        assert!(msg.contains("3 of 4"), "msg: {msg}");
        assert!(msg.contains("50%"), "msg: {msg}");
    }
}
