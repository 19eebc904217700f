//! Durable storage: the single source of truth for jobs, chunks and
//! activity completion markers.
//!
//! Everything lives in one SQLite database behind a mutex; multi-statement
//! writes run inside explicit transactions so callers observe either full
//! success or no effect. Chunk embeddings are additionally mirrored into an
//! in-process HNSW index for approximate nearest-neighbor search.

pub mod migrations;
pub mod vector_index;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use thiserror::Error;
use tracing::debug;

use crate::domain::chunk::validate_drafts;
use crate::domain::{Chunk, ChunkDraft, Job, JobStatus, Segment};
use crate::error::ActivityError;

pub use vector_index::VectorIndex;

/// Errors surfaced by store operations.
///
/// Busy/locked database errors are retriable; integrity and invariant
/// violations are permanent.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("transcription already saved for job {0}")]
    TranscriptionExists(i64),

    #[error("chunk invariant violated: {0}")]
    InvariantViolation(String),

    #[error("unknown chunk_index {index} for job {job_id}")]
    MissingChunkIndex { job_id: i64, index: i64 },

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("embedding for chunk_index {index} is not unit-normalized (norm {norm})")]
    NotUnitNorm { index: i64, norm: f32 },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Connection-level contention can be retried; everything else is a
    /// permanent condition.
    pub fn is_retriable(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl From<StoreError> for ActivityError {
    fn from(err: StoreError) -> Self {
        if err.is_retriable() {
            ActivityError::transient(err.to_string())
        } else {
            ActivityError::permanent(err.to_string())
        }
    }
}

/// Idempotency token written in the same transaction as an activity's
/// durable output. Presence of the `(workflow_run_id, activity_name)` row
/// certifies the output has been persisted.
#[derive(Debug, Clone)]
pub struct CompletionMarker {
    pub workflow_run_id: String,
    pub activity_name: String,
    /// Compact JSON summary of the output; never transcripts or vectors.
    pub payload: serde_json::Value,
}

/// A ranked semantic search candidate as returned by the store.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Cosine similarity in [-1, 1], higher is better.
    pub score: f32,
}

/// SQLite-backed store with an in-process vector index.
pub struct Store {
    conn: Mutex<Connection>,
    index: VectorIndex,
    dim: usize,
}

impl Store {
    /// Open (or create) the database at `path` and rebuild the vector index
    /// from persisted embeddings.
    pub fn open(path: &Path, dim: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::InvariantViolation(format!(
                        "cannot create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, dim)
    }

    /// Open an in-memory store. Used by tests and throwaway tooling.
    pub fn open_in_memory(dim: usize) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, dim)
    }

    fn from_connection(mut conn: Connection, dim: usize) -> Result<Self, StoreError> {
        // journal_mode returns the resulting mode as a row.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;

        migrations::run(&mut conn)?;

        let index = VectorIndex::new(dim);
        let mut loaded = 0usize;
        {
            let mut stmt =
                conn.prepare("SELECT id, embedding FROM job_chunks WHERE embedding IS NOT NULL")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                let (id, blob) = row?;
                let vector = decode_embedding(&blob);
                if vector.len() == dim {
                    index.insert(id, &vector);
                    loaded += 1;
                }
            }
        }
        debug!(vectors = loaded, "vector index rebuilt");

        Ok(Self {
            conn: Mutex::new(conn),
            index,
            dim,
        })
    }

    // ---- jobs ----

    /// Insert a pending job and return its id.
    pub fn create_job(
        &self,
        user_id: &str,
        filename: &str,
        file_path: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = format_ts(Utc::now());
        conn.execute(
            "INSERT INTO jobs (user_id, filename, file_path, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
            params![user_id, filename, file_path, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_job(&self, job_id: i64) -> Result<Job, StoreError> {
        let conn = self.conn.lock().unwrap();
        get_job_tx(&conn, job_id)
    }

    /// Jobs owned by `user_id`, newest first.
    pub fn list_jobs_by_user(&self, user_id: &str) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], row_to_job)?;
        collect_jobs(rows)
    }

    /// Jobs the scheduler should (re-)enqueue: anything non-terminal, in
    /// FIFO admission order.
    pub fn list_resumable_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status IN ('pending', 'processing')
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_job)?;
        collect_jobs(rows)
    }

    /// Move a job through the status machine. Rejects transitions the DAG
    /// does not permit; terminal states are absorbing.
    pub fn update_status(
        &self,
        job_id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let job = get_job_tx(&tx, job_id)?;
        if !job.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: job.status,
                to: status,
            });
        }
        let now = bump_ts(job.updated_at);
        tx.execute(
            "UPDATE jobs SET status = ?2, error = ?3, updated_at = ?4 WHERE id = ?1",
            params![job_id, status.as_str(), error, format_ts(now)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// One-shot write of the transcribe stage's output. Rejects a second
    /// write. When `marker` is given it is inserted in the same transaction.
    pub fn save_transcription(
        &self,
        job_id: i64,
        transcript: &str,
        segments: &[Segment],
        language: &str,
        marker: Option<&CompletionMarker>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let job = get_job_tx(&tx, job_id)?;
        if job.transcript.is_some() {
            return Err(StoreError::TranscriptionExists(job_id));
        }
        let segments_json = serde_json::to_string(segments)?;
        let now = bump_ts(job.updated_at);
        tx.execute(
            "UPDATE jobs SET transcript = ?2, segments = ?3, language = ?4, updated_at = ?5
             WHERE id = ?1",
            params![job_id, transcript, segments_json, language, format_ts(now)],
        )?;
        if let Some(marker) = marker {
            insert_marker(&tx, marker)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Atomically replace a job's chunks with `drafts`. The batch must tile
    /// the stored transcript exactly (checked in the same transaction).
    pub fn replace_chunks(
        &self,
        job_id: i64,
        drafts: &[ChunkDraft],
        marker: Option<&CompletionMarker>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let job = get_job_tx(&tx, job_id)?;
        let transcript_len = match &job.transcript {
            Some(t) => t.len(),
            None if drafts.is_empty() => 0,
            None => {
                return Err(StoreError::InvariantViolation(format!(
                    "job {job_id} has no transcript to chunk"
                )))
            }
        };
        validate_drafts(drafts, transcript_len).map_err(StoreError::InvariantViolation)?;

        tx.execute("DELETE FROM job_chunks WHERE job_id = ?1", params![job_id])?;
        {
            let now = format_ts(Utc::now());
            let mut stmt = tx.prepare(
                "INSERT INTO job_chunks
                   (job_id, chunk_index, text, topic_summary, keywords, confidence,
                    start_time, end_time, start_char_pos, end_char_pos, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for draft in drafts {
                stmt.execute(params![
                    job_id,
                    draft.chunk_index,
                    draft.text,
                    draft.topic_summary,
                    serde_json::to_string(&draft.keywords)?,
                    draft.confidence,
                    draft.start_time,
                    draft.end_time,
                    draft.start_char_pos,
                    draft.end_char_pos,
                    now,
                ])?;
            }
        }
        touch_job(&tx, job_id, job.updated_at)?;
        if let Some(marker) = marker {
            insert_marker(&tx, marker)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Bulk-write embeddings keyed by `chunk_index`. Rejects the whole batch
    /// if any index is missing, any vector has the wrong dimension, or any
    /// vector is not unit-normalized.
    pub fn patch_chunk_embeddings(
        &self,
        job_id: i64,
        vectors_by_index: &BTreeMap<i64, Vec<f32>>,
        marker: Option<&CompletionMarker>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let job = get_job_tx(&tx, job_id)?;

        let mut indexed: Vec<(i64, Vec<u8>, Vec<f32>)> = Vec::with_capacity(vectors_by_index.len());
        for (&chunk_index, vector) in vectors_by_index {
            if vector.len() != self.dim {
                return Err(StoreError::DimensionMismatch {
                    expected: self.dim,
                    got: vector.len(),
                });
            }
            let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            if (norm - 1.0).abs() >= 1e-3 {
                return Err(StoreError::NotUnitNorm {
                    index: chunk_index,
                    norm,
                });
            }
            let chunk_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM job_chunks WHERE job_id = ?1 AND chunk_index = ?2",
                    params![job_id, chunk_index],
                    |row| row.get(0),
                )
                .optional()?;
            let chunk_id = chunk_id.ok_or(StoreError::MissingChunkIndex {
                job_id,
                index: chunk_index,
            })?;
            indexed.push((chunk_id, encode_embedding(vector), vector.clone()));
        }

        for (chunk_id, blob, _) in &indexed {
            tx.execute(
                "UPDATE job_chunks SET embedding = ?2 WHERE id = ?1",
                params![chunk_id, blob],
            )?;
        }
        touch_job(&tx, job_id, job.updated_at)?;
        if let Some(marker) = marker {
            insert_marker(&tx, marker)?;
        }
        tx.commit()?;

        // Mirror into the ANN index only after the rows are durable.
        for (chunk_id, _, vector) in &indexed {
            self.index.insert(*chunk_id, vector);
        }
        Ok(())
    }

    /// Chunks of a job in ascending `chunk_index` order.
    pub fn get_chunks(&self, job_id: i64) -> Result<Vec<Chunk>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM job_chunks WHERE job_id = ?1 ORDER BY chunk_index ASC"
        ))?;
        let rows = stmt.query_map(params![job_id], row_to_chunk)?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row??);
        }
        Ok(chunks)
    }

    /// Approximate nearest-neighbor search over the chunks of `user_id`'s
    /// completed jobs. Returns up to `k` hits ordered by score descending,
    /// ties broken by `(created_at desc, chunk_id asc)`.
    pub fn search_chunks(
        &self,
        user_id: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if k == 0 || query.len() != self.dim {
            return Ok(Vec::new());
        }
        // Oversample: candidates owned by other users or non-completed jobs
        // are filtered after hydration.
        let fetch = (k * 8).max(64).min(self.index.len().max(1));
        let candidates = self.index.search(query, fetch);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; candidates.len()].join(", ");
        let user_param = candidates.len() + 1;
        let sql = format!(
            "SELECT {CHUNK_COLUMNS_QUALIFIED} FROM job_chunks c
             JOIN jobs j ON j.id = c.job_id
             WHERE c.id IN ({placeholders})
               AND j.user_id = ?{user_param}
               AND j.status = 'completed'
               AND c.embedding IS NOT NULL",
        );
        let mut stmt = conn.prepare(&sql)?;
        let params_iter = candidates
            .iter()
            .map(|(id, _)| rusqlite::types::Value::Integer(*id))
            .chain(std::iter::once(rusqlite::types::Value::Text(
                user_id.to_string(),
            )));
        let rows = stmt.query_map(params_from_iter(params_iter), row_to_chunk)?;

        let mut hits = Vec::new();
        for row in rows {
            let chunk = row??;
            let score = match &chunk.embedding {
                Some(embedding) => dot(query, embedding),
                None => continue,
            };
            hits.push(ScoredChunk { chunk, score });
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.chunk.created_at.cmp(&a.chunk.created_at))
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    // ---- activity completion markers ----

    /// Record an activity completion outside any output write. Normally
    /// markers ride along in the output transaction; this standalone form
    /// exists for activities with no durable output of their own.
    pub fn mark_activity_complete(&self, marker: &CompletionMarker) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        insert_marker(&conn, marker)?;
        Ok(())
    }

    pub fn is_activity_complete(
        &self,
        workflow_run_id: &str,
        activity_name: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM activity_completions
                 WHERE workflow_run_id = ?1 AND activity_name = ?2",
                params![workflow_run_id, activity_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ---- cancellation ----

    /// Flag a job for cooperative cancellation. Running activities observe
    /// the flag on their next heartbeat tick. No-op for terminal jobs.
    pub fn request_cancel(&self, job_id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let job = get_job_tx(&tx, job_id)?;
        if !job.status.is_terminal() {
            let now = bump_ts(job.updated_at);
            tx.execute(
                "UPDATE jobs SET cancel_requested = 1, updated_at = ?2 WHERE id = ?1",
                params![job_id, format_ts(now)],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn is_cancel_requested(&self, job_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let flag: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(0) != 0)
    }
}

// ---- row mapping ----

const JOB_COLUMNS: &str = "id, user_id, filename, file_path, status, transcript, segments, \
                           language, error, cancel_requested, created_at, updated_at";

const CHUNK_COLUMNS: &str = "id, job_id, chunk_index, text, topic_summary, keywords, confidence, \
                             start_time, end_time, start_char_pos, end_char_pos, embedding, \
                             created_at";

const CHUNK_COLUMNS_QUALIFIED: &str =
    "c.id, c.job_id, c.chunk_index, c.text, c.topic_summary, c.keywords, c.confidence, \
     c.start_time, c.end_time, c.start_char_pos, c.end_char_pos, c.embedding, c.created_at";

fn get_job_tx(conn: &Connection, job_id: i64) -> Result<Job, StoreError> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![job_id],
            row_to_job,
        )
        .optional()?;
    match job {
        Some(job) => job,
        None => Err(StoreError::NotFound(format!("job {job_id}"))),
    }
}

type JobRowResult = Result<Job, StoreError>;

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRowResult> {
    let status_raw: String = row.get(4)?;
    let segments_raw: Option<String> = row.get(6)?;
    let created_raw: String = row.get(10)?;
    let updated_raw: String = row.get(11)?;

    Ok((|| -> JobRowResult {
        let status = status_raw
            .parse::<JobStatus>()
            .map_err(StoreError::InvariantViolation)?;
        let segments: Option<Vec<Segment>> = match segments_raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        Ok(Job {
            id: row.get(0)?,
            user_id: row.get(1)?,
            filename: row.get(2)?,
            file_path: row.get(3)?,
            status,
            transcript: row.get(5)?,
            segments,
            language: row.get(7)?,
            error: row.get(8)?,
            cancel_requested: row.get::<_, i64>(9)? != 0,
            created_at: parse_ts(&created_raw)?,
            updated_at: parse_ts(&updated_raw)?,
        })
    })())
}

fn collect_jobs(
    rows: impl Iterator<Item = rusqlite::Result<JobRowResult>>,
) -> Result<Vec<Job>, StoreError> {
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row??);
    }
    Ok(jobs)
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Chunk, StoreError>> {
    let keywords_raw: String = row.get(5)?;
    let embedding_raw: Option<Vec<u8>> = row.get(11)?;
    let created_raw: String = row.get(12)?;

    Ok((|| -> Result<Chunk, StoreError> {
        Ok(Chunk {
            id: row.get(0)?,
            job_id: row.get(1)?,
            chunk_index: row.get(2)?,
            text: row.get(3)?,
            topic_summary: row.get(4)?,
            keywords: serde_json::from_str(&keywords_raw)?,
            confidence: row.get(6)?,
            start_time: row.get(7)?,
            end_time: row.get(8)?,
            start_char_pos: row.get(9)?,
            end_char_pos: row.get(10)?,
            embedding: embedding_raw.map(|blob| decode_embedding(&blob)),
            created_at: parse_ts(&created_raw)?,
        })
    })())
}

fn insert_marker(conn: &Connection, marker: &CompletionMarker) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO activity_completions
           (workflow_run_id, activity_name, payload, completed_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            marker.workflow_run_id,
            marker.activity_name,
            serde_json::to_string(&marker.payload)?,
            format_ts(Utc::now()),
        ],
    )?;
    Ok(())
}

/// Bump `updated_at` inside an open transaction.
fn touch_job(tx: &Transaction<'_>, job_id: i64, prev: DateTime<Utc>) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE jobs SET updated_at = ?2 WHERE id = ?1",
        params![job_id, format_ts(bump_ts(prev))],
    )?;
    Ok(())
}

// ---- timestamps ----

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvariantViolation(format!("bad timestamp {raw}: {e}")))
}

/// `updated_at` must strictly increase per job even when the wall clock
/// stands still within timestamp resolution.
fn bump_ts(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > prev {
        now
    } else {
        prev + Duration::milliseconds(1)
    }
}

// ---- embeddings ----

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_blob_round_trip() {
        let vector = vec![0.25f32, -1.5, 0.0, 3.25];
        assert_eq!(decode_embedding(&encode_embedding(&vector)), vector);
    }

    #[test]
    fn bump_ts_never_goes_backwards() {
        let future = Utc::now() + Duration::seconds(60);
        let bumped = bump_ts(future);
        assert!(bumped > future);
    }

    #[test]
    fn create_and_get_job() {
        let store = Store::open_in_memory(4).unwrap();
        let id = store.create_job("alice", "talk.mp3", "/tmp/talk.mp3").unwrap();
        let job = store.get_job(id).unwrap();
        assert_eq!(job.user_id, "alice");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.transcript.is_none());
        assert!(matches!(
            store.get_job(id + 1),
            Err(StoreError::NotFound(_))
        ));
    }
}
