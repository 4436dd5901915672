//! Job API handlers: create, list, detail, status poll, paged results,
//! pre-run estimate, cancel.
//!
//! `create_job` is the only handler that spawns work; everything else is a
//! read over the database, so status polling never blocks on a running job.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{RESULTS_DEFAULT_LIMIT, RESULTS_MAX_LIMIT};
use crate::dataset::DatasetError;
use crate::error::ApiError;
use crate::evaluation::db::JobProgressRow;
use crate::evaluation::queries::{self, JobSummaryRow, ResultFilter};
use crate::evaluation::scoring::{self, estimate_cost, CostEstimate};
use crate::evaluation::{chain, engine};
use crate::evaluation::{EvaluationJob, JobStatus, Prediction, PromptStep, QuestionKind};
use crate::providers::{model_rates, AdapterError, ModelConfig};
use crate::state::SharedState;

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub dataset_id: String,
    pub model_config: ModelConfig,
    pub prompt_chain: Vec<PromptStep>,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub total_images: i64,
    pub estimated_cost: f64,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
    pub filter: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub job_id: String,
    pub filter: String,
    pub offset: i64,
    pub limit: i64,
    pub predictions: Vec<Prediction>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub ok: bool,
    pub status: JobStatus,
    pub message: String,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn create_job(
    State(state): State<SharedState>,
    Json(body): Json<CreateJobRequest>,
) -> Result<Json<CreateJobResponse>, ApiError> {
    chain::validate(&body.prompt_chain).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    let mut prompt_chain = body.prompt_chain;
    chain::apply_system_message_defaults(&mut prompt_chain);

    let summary = state
        .datasets
        .describe(&body.dataset_id)
        .await
        .map_err(dataset_error)?;

    // Building the adapter up front surfaces config problems (unknown key,
    // missing credentials) to the caller instead of to a background worker.
    let adapter = state.adapters.build(&body.model_config).map_err(adapter_error)?;

    let rates = model_rates(body.model_config.provider, &body.model_config.model_name);
    let estimate = estimate_cost(summary.image_count as i64, prompt_chain.len(), rates);

    let job = EvaluationJob::new(
        body.dataset_id,
        summary.question,
        body.model_config,
        prompt_chain,
        summary.image_count as i64,
        estimate.estimated_cost,
    );
    state.db.insert_job(&job)?;
    info!(
        job_id = %job.id,
        dataset_id = %job.dataset_id,
        images = job.total_images,
        "job created"
    );

    let response = CreateJobResponse {
        job_id: job.id.clone(),
        status: job.status,
        total_images: job.total_images,
        estimated_cost: estimate.estimated_cost,
    };
    engine::spawn_job(state.clone(), job, adapter).await;
    Ok(Json(response))
}

pub async fn list_jobs(
    State(state): State<SharedState>,
) -> Result<Json<Vec<JobSummaryRow>>, ApiError> {
    Ok(Json(queries::list_jobs(&state.db)?))
}

pub async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<EvaluationJob>, ApiError> {
    let job = state
        .db
        .get_job(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?;
    Ok(Json(job))
}

pub async fn job_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<JobProgressRow>, ApiError> {
    let progress = state
        .db
        .job_progress(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?;
    Ok(Json(progress))
}

pub async fn job_results(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let job = state
        .db
        .get_job(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?;

    let filter_name = query.filter.unwrap_or_else(|| "all".to_string());
    let filter = ResultFilter::parse(&filter_name)
        .ok_or_else(|| ApiError::InvalidRequest(format!("unknown filter {filter_name:?}")))?;
    if filter.requires_binary() && job.question.kind != QuestionKind::Binary {
        return Err(ApiError::InvalidRequest(format!(
            "filter {filter_name:?} only applies to binary questions"
        )));
    }

    let offset = query.offset.unwrap_or(0).max(0);
    let limit = query
        .limit
        .unwrap_or(RESULTS_DEFAULT_LIMIT)
        .clamp(1, RESULTS_MAX_LIMIT);

    let predictions =
        queries::list_predictions(&state.db, &id, job.question.kind, filter, offset, limit)?;
    Ok(Json(ResultsResponse {
        job_id: id,
        filter: filter_name,
        offset,
        limit,
        predictions,
    }))
}

pub async fn estimate(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<CostEstimate>, ApiError> {
    let job = state
        .db
        .get_job(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?;
    let rates = model_rates(job.model_config.provider, &job.model_config.model_name);
    Ok(Json(estimate_cost(
        job.total_images,
        job.prompt_chain.len(),
        rates,
    )))
}

pub async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let job = state
        .db
        .get_job(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?;

    if job.status.is_terminal() {
        return Ok(Json(CancelResponse {
            ok: true,
            status: job.status,
            message: format!("job is already {}", job.status.as_str()),
        }));
    }

    if state.request_cancel(&id).await {
        info!(job_id = %id, "cancel requested; in-flight images will finish");
        return Ok(Json(CancelResponse {
            ok: true,
            status: job.status,
            message: "cancelling; in-flight images will finish".to_string(),
        }));
    }

    // Non-terminal row with no live worker: the process restarted under the
    // job. Freeze it directly over whatever predictions were persisted.
    let predictions = state.db.predictions_for_job(&id, job.question.kind)?;
    let summary = scoring::summarize(&job.question, &predictions, job.total_images);
    state.db.complete_job(
        &id,
        JobStatus::Cancelled,
        &summary,
        Some("cancelled with no live worker"),
    )?;
    info!(job_id = %id, "orphaned job cancelled");
    Ok(Json(CancelResponse {
        ok: true,
        status: JobStatus::Cancelled,
        message: "job had no live worker and was cancelled directly".to_string(),
    }))
}

// ============================================================================
// Error mapping
// ============================================================================

fn dataset_error(e: DatasetError) -> ApiError {
    match e {
        DatasetError::NotFound(id) => ApiError::NotFound(format!("dataset {id}")),
        DatasetError::InvalidManifest { .. } => ApiError::InvalidRequest(e.to_string()),
        DatasetError::ImageRead { .. } | DatasetError::Io(_) => ApiError::Internal(e.to_string()),
    }
}

fn adapter_error(e: AdapterError) -> ApiError {
    match e {
        AdapterError::Auth(_) | AdapterError::InvalidRequest(_) => {
            ApiError::InvalidRequest(e.to_string())
        }
        _ => ApiError::Internal(e.to_string()),
    }
}
