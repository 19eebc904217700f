//! Schema migrations, applied in order on open.
//!
//! The current schema version is tracked in SQLite's `user_version` pragma;
//! each migration runs inside its own transaction.

use rusqlite::Connection;

use super::StoreError;

const MIGRATIONS: &[&str] = &[
    // v1: jobs, chunks, activity completion markers
    r#"
    CREATE TABLE jobs (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id          TEXT NOT NULL,
        filename         TEXT NOT NULL,
        file_path        TEXT NOT NULL,
        status           TEXT NOT NULL DEFAULT 'pending',
        transcript       TEXT,
        segments         TEXT,
        language         TEXT,
        error            TEXT,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        created_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL
    );

    CREATE INDEX idx_jobs_user_created ON jobs(user_id, created_at DESC);
    CREATE INDEX idx_jobs_status ON jobs(status);

    CREATE TABLE job_chunks (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id         INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        chunk_index    INTEGER NOT NULL,
        text           TEXT NOT NULL,
        topic_summary  TEXT NOT NULL DEFAULT '',
        keywords       TEXT NOT NULL DEFAULT '[]',
        confidence     REAL NOT NULL DEFAULT 0,
        start_time     REAL NOT NULL,
        end_time       REAL NOT NULL,
        start_char_pos INTEGER NOT NULL,
        end_char_pos   INTEGER NOT NULL,
        embedding      BLOB,
        created_at     TEXT NOT NULL,
        UNIQUE (job_id, chunk_index)
    );

    CREATE INDEX idx_job_chunks_job ON job_chunks(job_id, chunk_index);

    CREATE TABLE activity_completions (
        workflow_run_id TEXT NOT NULL,
        activity_name   TEXT NOT NULL,
        payload         TEXT NOT NULL,
        completed_at    TEXT NOT NULL,
        PRIMARY KEY (workflow_run_id, activity_name)
    );
    "#,
];

/// Apply any migrations newer than the database's recorded version.
pub fn run(conn: &mut Connection) -> Result<(), StoreError> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }
    Ok(())
}
