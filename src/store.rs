//! SQLite job store shared by the three pipeline tools.
//!
//! Three tables: `dictionaries` (one row per scanned volume), `jobs` (one row
//! per page to extract), `batches` (submitted OpenAI batches and the job ids
//! they cover). The schema is created idempotently on open, so any of the
//! tools can run first against a fresh file.
//!
//! The store assumes a single writer process at a time. Within a process,
//! concurrent access is safe: the connection lives behind a mutex and every
//! multi-statement operation runs inside one transaction. Job hand-off between
//! engines relies on the atomic pending→processing flip in
//! [`JobStore::claim_pending_jobs`] — a claimed job is durably `processing`
//! before any request is built for it.

use crate::error::StoreError;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dictionaries (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    folder_name   TEXT UNIQUE,
    name          TEXT,
    description   TEXT,
    prompt_name   TEXT DEFAULT 'arabic_only_with_diacritics',
    context_pages INTEGER DEFAULT 1,
    skip_pages    INTEGER DEFAULT 0,
    pdf_path      TEXT,
    total_pages   INTEGER,
    status        TEXT DEFAULT 'pending',
    created_at    TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    completed_at  TIMESTAMP
);
CREATE TABLE IF NOT EXISTS jobs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    dictionary_id INTEGER REFERENCES dictionaries(id),
    page_num      INTEGER,
    status        TEXT DEFAULT 'pending',
    result_json   TEXT,
    error         TEXT,
    attempts      INTEGER DEFAULT 0,
    created_at    TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    completed_at  TIMESTAMP,
    UNIQUE(dictionary_id, page_num)
);
CREATE TABLE IF NOT EXISTS batches (
    id         TEXT PRIMARY KEY,
    file_id    TEXT,
    created_at TIMESTAMP,
    status     TEXT,
    job_ids    TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_dict   ON jobs(dictionary_id);
";

// ── Status enums ─────────────────────────────────────────────────────────

/// Lifecycle of a dictionary row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictStatus {
    Pending,
    Processing,
    Completed,
    Partial,
    Finalized,
}

impl DictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DictStatus::Pending => "pending",
            DictStatus::Processing => "processing",
            DictStatus::Completed => "completed",
            DictStatus::Partial => "partial",
            DictStatus::Finalized => "finalized",
        }
    }
}

impl fmt::Display for DictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(()),
        }
    }
}

/// Remote batch lifecycle states, plus the local terminal `Imported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
    /// Local state: results downloaded and written to the jobs table.
    Imported,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Validating => "validating",
            BatchState::InProgress => "in_progress",
            BatchState::Finalizing => "finalizing",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
            BatchState::Expired => "expired",
            BatchState::Cancelling => "cancelling",
            BatchState::Cancelled => "cancelled",
            BatchState::Imported => "imported",
        }
    }

    /// Parse a status string reported by the remote API.
    ///
    /// Unknown states are treated as still running so the poll loop keeps
    /// watching rather than guessing an outcome.
    pub fn from_remote(s: &str) -> Self {
        match BatchState::from_str(s) {
            Ok(state) => state,
            Err(_) => {
                warn!("Unknown batch status '{}', treating as in_progress", s);
                BatchState::InProgress
            }
        }
    }

    /// Whether this state ends the poll loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed
                | BatchState::Failed
                | BatchState::Expired
                | BatchState::Cancelled
                | BatchState::Imported
        )
    }

    /// Whether reaching this state returns the covered jobs to the pending
    /// pool. Failure, cancellation, and expiry all recycle the jobs; only a
    /// completed batch keeps them for import.
    pub fn reverts_jobs(&self) -> bool {
        matches!(
            self,
            BatchState::Failed | BatchState::Expired | BatchState::Cancelled
        )
    }
}

impl FromStr for BatchState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validating" => Ok(BatchState::Validating),
            "in_progress" => Ok(BatchState::InProgress),
            "finalizing" => Ok(BatchState::Finalizing),
            "completed" => Ok(BatchState::Completed),
            "failed" => Ok(BatchState::Failed),
            "expired" => Ok(BatchState::Expired),
            "cancelling" => Ok(BatchState::Cancelling),
            "cancelled" => Ok(BatchState::Cancelled),
            "imported" => Ok(BatchState::Imported),
            _ => Err(()),
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Row projections ──────────────────────────────────────────────────────

/// Metadata for a dictionary being registered by the preparation tool.
#[derive(Debug, Clone)]
pub struct DictionaryMeta {
    pub folder_name: String,
    pub name: String,
    pub description: String,
    pub prompt_name: String,
    pub context_pages: u32,
    pub skip_pages: u32,
    pub pdf_path: String,
    pub total_pages: u32,
}

/// Read-only job projection handed to the execution engines.
///
/// Joined with the owning dictionary's configuration so request building
/// needs no further store round-trips.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub dictionary_id: i64,
    pub page_num: u32,
    pub folder_name: String,
    pub pdf_path: String,
    pub total_pages: u32,
    pub context_pages: u32,
    pub prompt_name: String,
    pub attempts: u32,
}

impl ClaimedJob {
    /// Stable identifier correlating a batch output line with this job.
    pub fn custom_id(&self) -> String {
        format!("{}_page_{}", self.folder_name, self.page_num)
    }
}

/// A batch row awaiting import or recycling.
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub id: String,
    pub file_id: String,
    pub status: BatchState,
    pub job_ids: Vec<i64>,
}

/// A dictionary with at least one completed page, ready to merge.
#[derive(Debug, Clone)]
pub struct FinalizeCandidate {
    pub id: i64,
    pub folder_name: String,
    pub name: String,
    pub description: String,
    pub total_pages: u32,
    pub completed_pages: u32,
}

/// Per-dictionary progress line for the status views.
#[derive(Debug, Clone)]
pub struct DictProgress {
    pub folder_name: String,
    pub name: String,
    pub total_pages: u32,
    pub status: String,
    pub done: u32,
    pub pending: u32,
    pub failed: u32,
    pub processing: u32,
}

// ── Store ────────────────────────────────────────────────────────────────

/// Handle to the shared SQLite job store.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory store. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&mut conn)
    }

    // ── Preparation ──────────────────────────────────────────────────────

    /// Look up a dictionary's id and status by folder name.
    pub fn dictionary_by_folder(
        &self,
        folder: &str,
    ) -> Result<Option<(i64, String)>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, status FROM dictionaries WHERE folder_name = ?1",
                    params![folder],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Register a dictionary and create one pending job per page in
    /// `[skip_pages + 1, total_pages]`, all in one transaction.
    ///
    /// With `force`, any existing rows for the folder (jobs first, then the
    /// dictionary) are deleted before re-inserting.
    ///
    /// Returns the new dictionary id and the number of jobs created.
    pub fn create_dictionary_with_jobs(
        &self,
        meta: &DictionaryMeta,
        force: bool,
    ) -> Result<(i64, u32), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            if force {
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM dictionaries WHERE folder_name = ?1",
                        params![meta.folder_name],
                        |r| r.get(0),
                    )
                    .optional()?;
                if let Some(id) = existing {
                    tx.execute("DELETE FROM jobs WHERE dictionary_id = ?1", params![id])?;
                    tx.execute("DELETE FROM dictionaries WHERE id = ?1", params![id])?;
                    debug!("Force: deleted existing rows for '{}'", meta.folder_name);
                }
            }

            tx.execute(
                "INSERT INTO dictionaries
                   (folder_name, name, description, prompt_name, context_pages,
                    skip_pages, pdf_path, total_pages, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending')",
                params![
                    meta.folder_name,
                    meta.name,
                    meta.description,
                    meta.prompt_name,
                    meta.context_pages,
                    meta.skip_pages,
                    meta.pdf_path,
                    meta.total_pages,
                ],
            )?;
            let dict_id = tx.last_insert_rowid();

            let mut jobs_created = 0u32;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO jobs (dictionary_id, page_num, status)
                     VALUES (?1, ?2, 'pending')",
                )?;
                for page in (meta.skip_pages + 1)..=meta.total_pages {
                    stmt.execute(params![dict_id, page])?;
                    jobs_created += 1;
                }
            }

            tx.commit()?;
            Ok((dict_id, jobs_created))
        })
    }

    // ── Claiming ─────────────────────────────────────────────────────────

    /// Atomically claim up to `limit` pending jobs, flipping each to
    /// `processing` before it is returned.
    ///
    /// The per-row `WHERE status = 'pending'` guard means a job claimed by a
    /// concurrent engine is silently skipped rather than double-claimed.
    /// Jobs are returned in (dictionary, page) order so context pages of
    /// adjacent jobs render from warm document handles.
    pub fn claim_pending_jobs(
        &self,
        dict_filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ClaimedJob>, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let candidates: Vec<ClaimedJob> = {
                let mut sql = String::from(
                    "SELECT j.id, j.dictionary_id, j.page_num, j.attempts,
                            d.folder_name, d.pdf_path, d.total_pages,
                            d.context_pages, d.prompt_name
                     FROM jobs j
                     JOIN dictionaries d ON j.dictionary_id = d.id
                     WHERE j.status = 'pending'",
                );
                if dict_filter.is_some() {
                    sql.push_str(" AND d.folder_name = ?1");
                }
                sql.push_str(" ORDER BY d.id, j.page_num LIMIT ");
                sql.push_str(&limit.to_string());

                let mut stmt = tx.prepare(&sql)?;
                let map = |r: &rusqlite::Row<'_>| {
                    Ok(ClaimedJob {
                        id: r.get(0)?,
                        dictionary_id: r.get(1)?,
                        page_num: r.get(2)?,
                        attempts: r.get(3)?,
                        folder_name: r.get(4)?,
                        pdf_path: r.get(5)?,
                        total_pages: r.get(6)?,
                        context_pages: r.get(7)?,
                        prompt_name: r.get(8)?,
                    })
                };
                let rows = match dict_filter {
                    Some(f) => stmt.query_map(params![f], map)?,
                    None => stmt.query_map([], map)?,
                };
                rows.collect::<Result<_, _>>()?
            };

            let mut claimed = Vec::with_capacity(candidates.len());
            for job in candidates {
                let changed = tx.execute(
                    "UPDATE jobs SET status = 'processing'
                     WHERE id = ?1 AND status = 'pending'",
                    params![job.id],
                )?;
                if changed == 1 {
                    claimed.push(job);
                }
            }

            tx.commit()?;
            debug!("Claimed {} jobs", claimed.len());
            Ok(claimed)
        })
    }

    /// Reclaim jobs stuck in `processing` that no live batch covers.
    ///
    /// Run at engine startup: a crash between claiming and recording leaves
    /// jobs orphaned in `processing`. Jobs covered by a batch that is still
    /// pending import belong to the resume pass and are left alone.
    ///
    /// Returns the number of jobs returned to `pending`.
    pub fn reclaim_orphaned_processing(&self) -> Result<usize, StoreError> {
        let covered: std::collections::HashSet<i64> = self
            .unimported_batches()?
            .into_iter()
            .filter(|b| !b.status.reverts_jobs())
            .flat_map(|b| b.job_ids)
            .collect();

        self.with_conn(|conn| {
            let processing: Vec<i64> = {
                let mut stmt =
                    conn.prepare("SELECT id FROM jobs WHERE status = 'processing'")?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                rows.collect::<Result<_, _>>()?
            };

            let orphaned: Vec<i64> = processing
                .into_iter()
                .filter(|id| !covered.contains(id))
                .collect();

            let tx = conn.transaction()?;
            for id in &orphaned {
                tx.execute(
                    "UPDATE jobs SET status = 'pending'
                     WHERE id = ?1 AND status = 'processing'",
                    params![id],
                )?;
            }
            tx.commit()?;

            if !orphaned.is_empty() {
                warn!("Reclaimed {} orphaned processing jobs", orphaned.len());
            }
            Ok(orphaned.len())
        })
    }

    // ── Job outcomes ─────────────────────────────────────────────────────

    /// Record a successful extraction: status, payload, attempt count,
    /// completion timestamp.
    pub fn record_job_completed(
        &self,
        job_id: i64,
        result_json: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = ?1, result_json = ?2,
                        error = NULL, attempts = ?3, completed_at = ?4
                 WHERE id = ?5",
                params![
                    JobStatus::Completed.as_str(),
                    result_json,
                    attempts,
                    Utc::now().to_rfc3339(),
                    job_id
                ],
            )?;
            Ok(())
        })
    }

    /// Record a terminal failure with its error message.
    pub fn record_job_failed(
        &self,
        job_id: i64,
        error: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = ?1, error = ?2, attempts = ?3
                 WHERE id = ?4",
                params![JobStatus::Failed.as_str(), error, attempts, job_id],
            )?;
            Ok(())
        })
    }

    /// Return the given jobs to the pending pool, leaving `attempts`
    /// untouched.
    ///
    /// Guarded to `processing` rows so a repeated resume pass over the same
    /// batch is a no-op for jobs that have since completed.
    pub fn reset_jobs_to_pending(&self, job_ids: &[i64]) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut reset = 0;
            for id in job_ids {
                reset += tx.execute(
                    "UPDATE jobs SET status = 'pending'
                     WHERE id = ?1 AND status = 'processing'",
                    params![id],
                )?;
            }
            tx.commit()?;
            Ok(reset)
        })
    }

    // ── Batches ──────────────────────────────────────────────────────────

    /// Persist a newly submitted batch and the job ids it covers.
    pub fn create_batch(
        &self,
        batch_id: &str,
        file_id: &str,
        status: BatchState,
        job_ids: &[i64],
    ) -> Result<(), StoreError> {
        let ids_json = serde_json::to_string(job_ids)
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO batches (id, file_id, created_at, status, job_ids)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    batch_id,
                    file_id,
                    Utc::now().to_rfc3339(),
                    status.as_str(),
                    ids_json
                ],
            )?;
            Ok(())
        })
    }

    /// Record the latest observed state of a batch.
    pub fn update_batch_status(
        &self,
        batch_id: &str,
        status: BatchState,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE batches SET status = ?1 WHERE id = ?2",
                params![status.as_str(), batch_id],
            )?;
            Ok(())
        })
    }

    /// All batches whose results have not been imported yet.
    pub fn unimported_batches(&self) -> Result<Vec<BatchRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, file_id, status, job_ids FROM batches
                 WHERE status != 'imported' ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            })?;

            let mut batches = Vec::new();
            for row in rows {
                let (id, file_id, status, ids_json) = row?;
                let job_ids: Vec<i64> = serde_json::from_str(&ids_json).unwrap_or_default();
                batches.push(BatchRow {
                    id,
                    file_id,
                    status: BatchState::from_remote(&status),
                    job_ids,
                });
            }
            Ok(batches)
        })
    }

    /// Map batch output `custom_id`s back to job ids for the given jobs.
    pub fn custom_id_mapping(
        &self,
        job_ids: &[i64],
    ) -> Result<std::collections::HashMap<String, i64>, StoreError> {
        self.with_conn(|conn| {
            let mut mapping = std::collections::HashMap::new();
            let mut stmt = conn.prepare(
                "SELECT j.id, j.page_num, d.folder_name
                 FROM jobs j JOIN dictionaries d ON j.dictionary_id = d.id
                 WHERE j.id = ?1",
            )?;
            for id in job_ids {
                let row = stmt
                    .query_row(params![id], |r| {
                        Ok((
                            r.get::<_, i64>(0)?,
                            r.get::<_, u32>(1)?,
                            r.get::<_, String>(2)?,
                        ))
                    })
                    .optional()?;
                if let Some((job_id, page, folder)) = row {
                    mapping.insert(format!("{folder}_page_{page}"), job_id);
                }
            }
            Ok(mapping)
        })
    }

    // ── Progress & finalization queries ──────────────────────────────────

    /// Number of pending jobs, optionally restricted to one dictionary.
    pub fn pending_job_count(&self, dict_filter: Option<&str>) -> Result<u32, StoreError> {
        self.with_conn(|conn| {
            let count = match dict_filter {
                Some(f) => conn.query_row(
                    "SELECT COUNT(*) FROM jobs j
                     JOIN dictionaries d ON j.dictionary_id = d.id
                     WHERE j.status = 'pending' AND d.folder_name = ?1",
                    params![f],
                    |r| r.get(0),
                )?,
                None => conn.query_row(
                    "SELECT COUNT(*) FROM jobs WHERE status = 'pending'",
                    [],
                    |r| r.get(0),
                )?,
            };
            Ok(count)
        })
    }

    /// Per-dictionary progress rows for the status and summary views.
    pub fn dictionary_progress(&self) -> Result<Vec<DictProgress>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.folder_name, d.name, d.total_pages, d.status,
                        COUNT(CASE WHEN j.status = 'completed'  THEN 1 END),
                        COUNT(CASE WHEN j.status = 'pending'    THEN 1 END),
                        COUNT(CASE WHEN j.status = 'failed'     THEN 1 END),
                        COUNT(CASE WHEN j.status = 'processing' THEN 1 END)
                 FROM dictionaries d
                 LEFT JOIN jobs j ON d.id = j.dictionary_id
                 GROUP BY d.id
                 ORDER BY d.created_at DESC",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(DictProgress {
                    folder_name: r.get(0)?,
                    name: r.get(1)?,
                    total_pages: r.get::<_, Option<u32>>(2)?.unwrap_or(0),
                    status: r.get(3)?,
                    done: r.get(4)?,
                    pending: r.get(5)?,
                    failed: r.get(6)?,
                    processing: r.get(7)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// Dictionaries with at least one completed job that are not yet
    /// finalized, optionally restricted to one folder.
    pub fn finalize_candidates(
        &self,
        dict_filter: Option<&str>,
    ) -> Result<Vec<FinalizeCandidate>, StoreError> {
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT d.id, d.folder_name, d.name, d.description, d.total_pages,
                        COUNT(CASE WHEN j.status = 'completed' THEN 1 END) AS done
                 FROM dictionaries d
                 JOIN jobs j ON d.id = j.dictionary_id
                 WHERE d.status != 'finalized'",
            );
            if dict_filter.is_some() {
                sql.push_str(" AND d.folder_name = ?1");
            }
            sql.push_str(" GROUP BY d.id HAVING done > 0");

            let mut stmt = conn.prepare(&sql)?;
            let map = |r: &rusqlite::Row<'_>| {
                Ok(FinalizeCandidate {
                    id: r.get(0)?,
                    folder_name: r.get(1)?,
                    name: r.get(2)?,
                    description: r.get(3)?,
                    total_pages: r.get(4)?,
                    completed_pages: r.get(5)?,
                })
            };
            let rows = match dict_filter {
                Some(f) => stmt.query_map(params![f], map)?,
                None => stmt.query_map([], map)?,
            };
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// All non-empty completed page payloads for a dictionary, in page order.
    pub fn completed_page_payloads(
        &self,
        dict_id: i64,
    ) -> Result<Vec<(u32, String)>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT page_num, result_json FROM jobs
                 WHERE dictionary_id = ?1 AND status = 'completed'
                   AND result_json IS NOT NULL AND result_json != ''
                 ORDER BY page_num ASC",
            )?;
            let rows = stmt.query_map(params![dict_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// Mark a dictionary finalized with a completion timestamp.
    pub fn mark_dictionary_finalized(&self, dict_id: i64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE dictionaries SET status = 'finalized', completed_at = ?1
                 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), dict_id],
            )?;
            Ok(())
        })
    }

    /// Derive a dictionary's status from its job counts.
    ///
    /// All jobs completed → `completed`; some completed or failed with none
    /// outstanding → `partial`; anything still pending or processing →
    /// `processing`. A finalized dictionary is never downgraded.
    pub fn refresh_dictionary_status(&self, dict_id: i64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let (total, done, outstanding): (u32, u32, u32) = conn.query_row(
                "SELECT COUNT(*),
                        COUNT(CASE WHEN status = 'completed' THEN 1 END),
                        COUNT(CASE WHEN status IN ('pending', 'processing') THEN 1 END)
                 FROM jobs WHERE dictionary_id = ?1",
                params![dict_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )?;

            let status = if total > 0 && done == total {
                DictStatus::Completed
            } else if outstanding > 0 {
                DictStatus::Processing
            } else {
                DictStatus::Partial
            };

            conn.execute(
                "UPDATE dictionaries SET status = ?1
                 WHERE id = ?2 AND status != 'finalized'",
                params![status.as_str(), dict_id],
            )?;
            Ok(())
        })
    }

    /// Fetch one job's (status, attempts, error) for inspection. Test helper
    /// kept in the public API because the binaries use it for reporting too.
    pub fn job_state(&self, job_id: i64) -> Result<(JobStatus, u32, Option<String>), StoreError> {
        let (status, attempts, error): (String, u32, Option<String>) = self.with_conn(|conn| {
            let row = conn.query_row(
                "SELECT status, attempts, error FROM jobs WHERE id = ?1",
                params![job_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )?;
            Ok(row)
        })?;
        let status = status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("unknown job status '{status}'")))?;
        Ok((status, attempts, error))
    }

    /// A dictionary's finalization timestamp, if it has one.
    pub fn dictionary_completed_at(&self, dict_id: i64) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            let row = conn.query_row(
                "SELECT completed_at FROM dictionaries WHERE id = ?1",
                params![dict_id],
                |r| r.get(0),
            )?;
            Ok(row)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(folder: &str, total: u32, skip: u32) -> DictionaryMeta {
        DictionaryMeta {
            folder_name: folder.to_string(),
            name: format!("معجم {folder}"),
            description: "test dictionary".to_string(),
            prompt_name: "arabic_only_with_diacritics".to_string(),
            context_pages: 1,
            skip_pages: skip,
            pdf_path: format!("/data/{folder}/{folder}.pdf"),
            total_pages: total,
        }
    }

    #[test]
    fn jobs_cover_contiguous_page_range() {
        let store = JobStore::open_in_memory().unwrap();
        let (_, created) = store
            .create_dictionary_with_jobs(&meta("alqab", 10, 3), false)
            .unwrap();
        assert_eq!(created, 7);

        let jobs = store.claim_pending_jobs(None, 100).unwrap();
        let pages: Vec<u32> = jobs.iter().map(|j| j.page_num).collect();
        assert_eq!(pages, (4..=10).collect::<Vec<u32>>());
    }

    #[test]
    fn claim_flips_to_processing_and_is_exclusive() {
        let store = JobStore::open_in_memory().unwrap();
        store
            .create_dictionary_with_jobs(&meta("alqab", 5, 0), false)
            .unwrap();

        let first = store.claim_pending_jobs(None, 3).unwrap();
        assert_eq!(first.len(), 3);
        let second = store.claim_pending_jobs(None, 10).unwrap();
        assert_eq!(second.len(), 2);

        let (status, _, _) = store.job_state(first[0].id).unwrap();
        assert_eq!(status, JobStatus::Processing);
    }

    #[test]
    fn claim_respects_dictionary_filter() {
        let store = JobStore::open_in_memory().unwrap();
        store
            .create_dictionary_with_jobs(&meta("alqab", 3, 0), false)
            .unwrap();
        store
            .create_dictionary_with_jobs(&meta("hydrology", 4, 0), false)
            .unwrap();

        let jobs = store.claim_pending_jobs(Some("hydrology"), 10).unwrap();
        assert_eq!(jobs.len(), 4);
        assert!(jobs.iter().all(|j| j.folder_name == "hydrology"));
    }

    #[test]
    fn force_recreate_replaces_jobs() {
        let store = JobStore::open_in_memory().unwrap();
        store
            .create_dictionary_with_jobs(&meta("alqab", 5, 0), false)
            .unwrap();
        // Without force the UNIQUE constraint rejects the duplicate.
        assert!(store
            .create_dictionary_with_jobs(&meta("alqab", 8, 0), false)
            .is_err());

        let (_, created) = store
            .create_dictionary_with_jobs(&meta("alqab", 8, 2), true)
            .unwrap();
        assert_eq!(created, 6);
        assert_eq!(store.pending_job_count(None).unwrap(), 6);
    }

    #[test]
    fn reset_leaves_attempts_and_completed_jobs_untouched() {
        let store = JobStore::open_in_memory().unwrap();
        store
            .create_dictionary_with_jobs(&meta("alqab", 3, 0), false)
            .unwrap();
        let jobs = store.claim_pending_jobs(None, 3).unwrap();

        store
            .record_job_completed(jobs[0].id, "{\"a\":\"b\"}", 2)
            .unwrap();

        let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
        let reset = store.reset_jobs_to_pending(&ids).unwrap();
        assert_eq!(reset, 2);

        // Completed job survives the reset.
        let (status, attempts, _) = store.job_state(jobs[0].id).unwrap();
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(attempts, 2);

        // Reset job is pending with attempts unchanged.
        let (status, attempts, _) = store.job_state(jobs[1].id).unwrap();
        assert_eq!(status, JobStatus::Pending);
        assert_eq!(attempts, 0);

        // Second pass is a no-op.
        assert_eq!(store.reset_jobs_to_pending(&ids).unwrap(), 0);
    }

    #[test]
    fn cancelled_batch_recycles_jobs() {
        let store = JobStore::open_in_memory().unwrap();
        store
            .create_dictionary_with_jobs(&meta("alqab", 4, 0), false)
            .unwrap();
        let jobs = store.claim_pending_jobs(None, 4).unwrap();
        let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();

        store
            .create_batch("batch_abc", "file_xyz", BatchState::Validating, &ids)
            .unwrap();

        // Remote reports cancellation: jobs go back to the pool, the batch
        // keeps the terminal state.
        assert!(BatchState::Cancelled.reverts_jobs());
        store.reset_jobs_to_pending(&ids).unwrap();
        store
            .update_batch_status("batch_abc", BatchState::Cancelled)
            .unwrap();

        assert_eq!(store.pending_job_count(None).unwrap(), 4);
        let batches = store.unimported_batches().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].status, BatchState::Cancelled);
        assert_eq!(batches[0].job_ids, ids);
    }

    #[test]
    fn orphaned_processing_jobs_are_reclaimed() {
        let store = JobStore::open_in_memory().unwrap();
        store
            .create_dictionary_with_jobs(&meta("alqab", 4, 0), false)
            .unwrap();
        let jobs = store.claim_pending_jobs(None, 4).unwrap();

        // Two of the four are covered by a live batch.
        let covered: Vec<i64> = jobs[..2].iter().map(|j| j.id).collect();
        store
            .create_batch("batch_live", "file_1", BatchState::InProgress, &covered)
            .unwrap();

        let reclaimed = store.reclaim_orphaned_processing().unwrap();
        assert_eq!(reclaimed, 2);
        assert_eq!(store.pending_job_count(None).unwrap(), 2);

        let (status, _, _) = store.job_state(covered[0]).unwrap();
        assert_eq!(status, JobStatus::Processing);
    }

    #[test]
    fn custom_id_mapping_round_trips() {
        let store = JobStore::open_in_memory().unwrap();
        store
            .create_dictionary_with_jobs(&meta("hydrology", 2, 0), false)
            .unwrap();
        let jobs = store.claim_pending_jobs(None, 2).unwrap();
        let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();

        let mapping = store.custom_id_mapping(&ids).unwrap();
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping.get("hydrology_page_1"), Some(&jobs[0].id));
        assert_eq!(jobs[0].custom_id(), "hydrology_page_1");
    }

    #[test]
    fn refresh_status_tracks_job_counts() {
        let store = JobStore::open_in_memory().unwrap();
        let (dict_id, _) = store
            .create_dictionary_with_jobs(&meta("alqab", 2, 0), false)
            .unwrap();
        let jobs = store.claim_pending_jobs(None, 2).unwrap();

        store.record_job_completed(jobs[0].id, "{}", 1).unwrap();
        store.refresh_dictionary_status(dict_id).unwrap();
        let progress = store.dictionary_progress().unwrap();
        assert_eq!(progress[0].status, "processing");

        store.record_job_failed(jobs[1].id, "bad page", 1).unwrap();
        store.refresh_dictionary_status(dict_id).unwrap();
        let progress = store.dictionary_progress().unwrap();
        assert_eq!(progress[0].status, "partial");

        store.record_job_completed(jobs[1].id, "{}", 2).unwrap();
        store.refresh_dictionary_status(dict_id).unwrap();
        let progress = store.dictionary_progress().unwrap();
        assert_eq!(progress[0].status, "completed");
    }

    #[test]
    fn finalize_candidates_require_completed_pages() {
        let store = JobStore::open_in_memory().unwrap();
        let (dict_id, _) = store
            .create_dictionary_with_jobs(&meta("alqab", 3, 0), false)
            .unwrap();
        assert!(store.finalize_candidates(None).unwrap().is_empty());

        let jobs = store.claim_pending_jobs(None, 1).unwrap();
        store
            .record_job_completed(jobs[0].id, "{\"كَلِمَة\":\"تعريف\"}", 1)
            .unwrap();

        let candidates = store.finalize_candidates(None).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].completed_pages, 1);

        assert!(store.dictionary_completed_at(dict_id).unwrap().is_none());
        store.mark_dictionary_finalized(dict_id).unwrap();
        assert!(store.finalize_candidates(None).unwrap().is_empty());
        assert!(store.dictionary_completed_at(dict_id).unwrap().is_some());
    }

    #[test]
    fn unknown_remote_state_keeps_polling() {
        assert_eq!(BatchState::from_remote("warming_up"), BatchState::InProgress);
        assert!(!BatchState::InProgress.is_terminal());
        assert!(BatchState::Expired.is_terminal());
        assert!(BatchState::Expired.reverts_jobs());
        assert!(!BatchState::Completed.reverts_jobs());
    }
}
