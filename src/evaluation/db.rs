use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{
    EvaluationJob, JobStatus, ParsedAnswer, Prediction, QuestionKind, QuestionSpec, ResultsSummary,
};

pub struct EvalDb {
    conn: Mutex<Connection>,
    #[allow(dead_code)]
    db_path: PathBuf,
}

/// Lightweight row for the status poll; avoids parsing the JSON columns.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgressRow {
    pub status: JobStatus,
    pub processed_images: i64,
    pub total_images: i64,
}

impl EvalDb {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                dataset_id TEXT NOT NULL,
                question_json TEXT NOT NULL,
                model_config_json TEXT NOT NULL,
                prompt_chain_json TEXT NOT NULL,
                status TEXT NOT NULL,
                total_images INTEGER NOT NULL DEFAULT 0,
                processed_images INTEGER NOT NULL DEFAULT 0,
                accuracy REAL,
                results_summary_json TEXT,
                estimated_cost REAL,
                actual_cost REAL,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS predictions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                image_id TEXT NOT NULL,
                step_results_json TEXT NOT NULL,
                parsed_answer TEXT,
                ground_truth TEXT,
                is_correct INTEGER,
                error TEXT,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                tokens_used INTEGER,
                cost REAL,
                created_at TEXT NOT NULL,
                UNIQUE(job_id, image_id)
            );

            CREATE INDEX IF NOT EXISTS idx_predictions_job ON predictions(job_id);
            CREATE INDEX IF NOT EXISTS idx_predictions_correct ON predictions(job_id, is_correct);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);
        ",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ========================================================================
    // Job CRUD
    // ========================================================================

    pub fn insert_job(&self, job: &EvaluationJob) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO jobs (id, dataset_id, question_json, model_config_json, prompt_chain_json,
                status, total_images, processed_images, estimated_cost, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.id,
                job.dataset_id,
                serde_json::to_string(&job.question)?,
                serde_json::to_string(&job.model_config)?,
                serde_json::to_string(&job.prompt_chain)?,
                job.status.as_str(),
                job.total_images,
                job.processed_images,
                job.estimated_cost,
                job.created_at,
            ],
        )?;
        Ok(())
    }

    /// pending -> running, stamping `started_at` and the dataset's final
    /// image count. Returns false if the job was not pending.
    pub fn mark_running(&self, job_id: &str, total_images: i64) -> anyhow::Result<bool> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE jobs SET status='running', total_images=?2, started_at=?3
             WHERE id=?1 AND status='pending'",
            params![job_id, total_images, now],
        )?;
        Ok(updated > 0)
    }

    /// Per-image tasks report counts out of order; the guard keeps the
    /// stored counter monotonic so a stale write never lowers it.
    pub fn update_progress(&self, job_id: &str, processed_images: i64) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE jobs SET processed_images=?2 WHERE id=?1 AND processed_images < ?2",
            params![job_id, processed_images],
        )?;
        Ok(())
    }

    /// Freezes a job into a terminal state with its scored summary. The
    /// status guard makes terminal states one-way: a second call (or a late
    /// cancel racing completion) updates nothing and returns false.
    pub fn complete_job(
        &self,
        job_id: &str,
        status: JobStatus,
        summary: &ResultsSummary,
        error_message: Option<&str>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE jobs SET
                status=?2,
                processed_images=?3,
                accuracy=?4,
                results_summary_json=?5,
                actual_cost=?6,
                error_message=?7,
                completed_at=?8
             WHERE id=?1 AND status IN ('pending', 'running')",
            params![
                job_id,
                status.as_str(),
                summary.processed,
                summary.accuracy,
                serde_json::to_string(summary)?,
                summary.actual_cost,
                error_message,
                now,
            ],
        )?;
        Ok(updated > 0)
    }

    // ========================================================================
    // Prediction CRUD
    // ========================================================================

    pub fn insert_prediction(&self, pred: &Prediction) -> anyhow::Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO predictions (job_id, image_id, step_results_json, parsed_answer,
                ground_truth, is_correct, error, latency_ms, tokens_used, cost, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                pred.job_id,
                pred.image_id,
                serde_json::to_string(&pred.step_results)?,
                pred.parsed_answer.as_ref().map(|a| a.canonical()),
                pred.ground_truth,
                pred.is_correct.map(|b| b as i64),
                pred.error,
                pred.latency_ms as i64,
                pred.tokens_used.map(|t| t as i64),
                pred.cost,
                pred.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn predictions_for_job(
        &self,
        job_id: &str,
        kind: QuestionKind,
    ) -> anyhow::Result<Vec<Prediction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, image_id, step_results_json, parsed_answer, ground_truth,
                    is_correct, error, latency_ms, tokens_used, cost, created_at
             FROM predictions WHERE job_id=?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![job_id], |row| prediction_from_row(row, kind))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ========================================================================
    // Query helpers
    // ========================================================================

    pub fn get_job(&self, job_id: &str) -> anyhow::Result<Option<EvaluationJob>> {
        let conn = self.conn();
        let result = conn
            .query_row(
                "SELECT id, dataset_id, question_json, model_config_json, prompt_chain_json,
                        status, total_images, processed_images, accuracy, results_summary_json,
                        estimated_cost, actual_cost, error_message, created_at, started_at, completed_at
                 FROM jobs WHERE id=?1",
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn job_progress(&self, job_id: &str) -> anyhow::Result<Option<JobProgressRow>> {
        let conn = self.conn();
        let result = conn
            .query_row(
                "SELECT status, processed_images, total_images FROM jobs WHERE id=?1",
                params![job_id],
                |row| {
                    Ok(JobProgressRow {
                        status: status_from_row(row, 0)?,
                        processed_images: row.get(1)?,
                        total_images: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }
}

// ============================================================================
// Row mappers
// ============================================================================

pub(crate) fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EvaluationJob> {
    let question: QuestionSpec = json_column(row, 2)?;
    Ok(EvaluationJob {
        id: row.get(0)?,
        dataset_id: row.get(1)?,
        question,
        model_config: json_column(row, 3)?,
        prompt_chain: json_column(row, 4)?,
        status: status_from_row(row, 5)?,
        total_images: row.get(6)?,
        processed_images: row.get(7)?,
        accuracy: row.get(8)?,
        results_summary: row
            .get::<_, Option<String>>(9)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        estimated_cost: row.get(10)?,
        actual_cost: row.get(11)?,
        error_message: row.get(12)?,
        created_at: row.get(13)?,
        started_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

pub(crate) fn prediction_from_row(
    row: &rusqlite::Row<'_>,
    kind: QuestionKind,
) -> rusqlite::Result<Prediction> {
    Ok(Prediction {
        id: row.get(0)?,
        job_id: row.get(1)?,
        image_id: row.get(2)?,
        step_results: json_column(row, 3)?,
        parsed_answer: row
            .get::<_, Option<String>>(4)?
            .and_then(|s| ParsedAnswer::from_canonical(kind, &s)),
        ground_truth: row.get(5)?,
        is_correct: row.get::<_, Option<i64>>(6)?.map(|v| v != 0),
        error: row.get(7)?,
        latency_ms: row.get::<_, i64>(8)? as u64,
        tokens_used: row.get::<_, Option<i64>>(9)?.map(|t| t as u64),
        cost: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn status_from_row(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<JobStatus> {
    let raw: String = row.get(idx)?;
    JobStatus::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown job status {raw:?}").into(),
        )
    })
}
