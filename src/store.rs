// src/store.rs
//
// =============================================================================
// RAILYARD: JOB STORE
// =============================================================================
//
// The persistence layer. A single SQLite file is the whole of Railyard's
// durable state: jobs, nodes, and a small `meta` table for housekeeping
// cursors. Unlike a denormalized blob store, the columns the scheduler
// actually filters/sorts on (status, queue, priority, created_at) are real
// columns so `get_next_job` can be one SQL statement instead of an
// application-level scan.
//
// HPC-safe journaling carried over from the prior generation of this code:
// DELETE journal mode avoids WAL files on networked filesystems, and a
// generous busy_timeout absorbs contention from concurrent readers.

use crate::core::{
    Classification, EnginePreference, FailureReason, HardwareDescriptor, Job, JobResult,
    JobStatus, Node, NodeClass, NodeStatus, Priority, Queue,
};
use crate::error::StoreError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection, StoreError> {
        Ok(Connection::open(&self.path)?)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;

        conn.execute_batch(
            "PRAGMA journal_mode=DELETE;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;",
        )?;

        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT
            );

            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                address TEXT UNIQUE NOT NULL,
                status TEXT NOT NULL,
                current_job_id TEXT,
                registered_at_ms INTEGER NOT NULL,
                last_heartbeat_ms INTEGER NOT NULL,
                hardware_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                scenario TEXT NOT NULL,
                status TEXT NOT NULL,
                queue TEXT NOT NULL,
                priority TEXT NOT NULL,
                classification TEXT NOT NULL,
                engine TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                node_id TEXT,
                created_at_ms INTEGER NOT NULL,
                assigned_at_ms INTEGER,
                started_at_ms INTEGER,
                completed_at_ms INTEGER,
                full_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_queue_priority
                ON jobs(status, queue, priority, created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_nodes_status ON nodes(status);
            COMMIT;",
        )?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // JOB OPERATIONS
    // -------------------------------------------------------------------------

    pub fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.conn()?;
        insert_job(&conn, job)?;
        Ok(())
    }

    /// Pending -> Queued. Idempotent: re-enqueuing a job already past
    /// Pending is a no-op rather than an error, since the promoter loop
    /// may race a submission-time enqueue.
    pub fn enqueue(&self, job_id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let mut job = load_job(&conn, job_id)?;
        if job.status == JobStatus::Pending {
            job.status = JobStatus::Queued;
            update_job_row(&conn, &job)?;
        }
        Ok(())
    }

    /// Atomically claims the next eligible job for `node_id` and marks it
    /// Assigned. `BEGIN IMMEDIATE` takes SQLite's write lock up front so two
    /// concurrent callers can't both read the same candidate row before
    /// either writes; the `WHERE status = 'queued'` guard on the UPDATE is
    /// what actually prevents a double-assign if that assumption ever stops
    /// holding (e.g. a future multi-connection pool).
    ///
    /// `free_slots` is the number of jobs this node can still take on
    /// concurrently; a node already at capacity (per `active_job_count`,
    /// not the single-job `nodes.current_job_id` scalar) gets nothing back.
    pub fn get_next_job(&self, node_id: Uuid, free_slots: usize) -> Result<Option<Job>, StoreError> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = self.get_next_job_locked(&conn, node_id, free_slots);
        match &result {
            Ok(_) => conn.execute_batch("COMMIT")?,
            Err(_) => conn.execute_batch("ROLLBACK")?,
        }
        result
    }

    fn get_next_job_locked(
        &self,
        tx: &Connection,
        node_id: Uuid,
        free_slots: usize,
    ) -> Result<Option<Job>, StoreError> {
        if free_slots == 0 {
            return Ok(None);
        }

        let node = load_node(tx, node_id)?;
        if node.status != NodeStatus::Available && node.status != NodeStatus::Busy {
            return Ok(None);
        }
        if active_job_count(tx, node_id)? >= free_slots {
            return Ok(None);
        }

        let mut stmt = tx.prepare(
            "SELECT id FROM jobs
             WHERE status = 'queued'
             ORDER BY
                CASE queue WHEN 'live' THEN 0 WHEN 'default' THEN 1 ELSE 2 END,
                CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END,
                created_at_ms ASC",
        )?;
        let candidate_ids: Vec<String> = stmt
            .query_map([], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        for id_str in candidate_ids {
            let job_id: Uuid = id_str.parse().map_err(|_| StoreError::internal("bad job id in store"))?;
            let mut job = load_job(tx, job_id)?;

            let engine_ok = match job.engine {
                EnginePreference::Auto => true,
                EnginePreference::Ffmpeg => node.hardware.supports_engine("ffmpeg"),
                EnginePreference::Gstreamer => {
                    // Streaming preference falls back to the file engine on
                    // nodes that don't run gstreamer (spec.md §9 open question).
                    node.hardware.supports_engine("gstreamer") || node.hardware.supports_engine("ffmpeg")
                }
            };
            if !engine_ok || !job.requirements.satisfied_by(&node.hardware) {
                continue;
            }

            let rows = tx.execute(
                "UPDATE jobs SET status = 'assigned', node_id = ?1, assigned_at_ms = ?2
                 WHERE id = ?3 AND status = 'queued'",
                params![node_id.to_string(), Utc::now().timestamp_millis(), id_str],
            )?;
            if rows == 0 {
                // Lost the race (shouldn't happen under a single writer, but
                // the guard is what makes the invariant true rather than
                // assumed).
                continue;
            }

            job.status = JobStatus::Assigned;
            job.node_id = Some(node_id);
            job.assigned_at = Some(Utc::now());

            tx.execute(
                "UPDATE nodes SET status = 'busy', current_job_id = ?1 WHERE id = ?2",
                params![job.id.to_string(), node_id.to_string()],
            )?;

            return Ok(Some(job));
        }

        Ok(None)
    }

    pub fn update_job_status(
        &self,
        job_id: Uuid,
        next: JobStatus,
        failure_reason: Option<FailureReason>,
        result: Option<JobResult>,
    ) -> Result<Job, StoreError> {
        let conn = self.conn()?;
        let mut job = load_job(&conn, job_id)?;

        if !job.status.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                from: job.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }

        let releases_node = job.node_id;
        let now = Utc::now();
        match next {
            JobStatus::Running => job.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled => {
                job.completed_at = Some(now);
            }
            JobStatus::Queued if job.status != JobStatus::Pending => {
                // Reclamation: free the node link, bump retry count.
                job.node_id = None;
                job.assigned_at = None;
                job.started_at = None;
                job.retry_count += 1;
            }
            _ => {}
        }
        job.status = next;
        job.failure_reason = failure_reason;
        if result.is_some() {
            job.result = result;
        }

        update_job_row(&conn, &job)?;

        if next.is_terminal() || next == JobStatus::Queued {
            if let Some(node_id) = releases_node {
                refresh_node_status(&conn, node_id)?;
            }
        }

        Ok(job)
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let conn = self.conn()?;
        load_job(&conn, job_id)
    }

    pub fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = match status {
            Some(_) => conn.prepare(
                "SELECT full_json FROM jobs WHERE status = ?1 ORDER BY created_at_ms DESC LIMIT ?2",
            )?,
            None => conn
                .prepare("SELECT full_json FROM jobs ORDER BY created_at_ms DESC LIMIT ?1")?,
        };

        let jobs: Vec<Job> = if let Some(s) = status {
            stmt.query_map(params![s.as_str(), limit], |r| r.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .filter_map(|j| serde_json::from_str(&j).ok())
                .collect()
        } else {
            stmt.query_map(params![limit], |r| r.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .filter_map(|j| serde_json::from_str(&j).ok())
                .collect()
        };
        Ok(jobs)
    }

    // -------------------------------------------------------------------------
    // NODE OPERATIONS
    // -------------------------------------------------------------------------

    /// Registers a node. A second registration from the same address
    /// updates the existing row in place and returns the *original* id —
    /// the worker never gets a second identity just by restarting.
    pub fn register_node(&self, address: &str, hardware: &HardwareDescriptor) -> Result<(Node, bool), StoreError> {
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row("SELECT id FROM nodes WHERE address = ?1", params![address], |r| r.get(0))
            .optional()?;

        let now = Utc::now();
        if let Some(id_str) = existing {
            let id: Uuid = id_str.parse().map_err(|_| StoreError::internal("bad node id"))?;
            let hw_json = serde_json::to_string(hardware).map_err(|e| StoreError::internal(e.to_string()))?;

            // A fresh process restart invalidates any job this address was
            // previously bound to — reclaim it onto the queue rather than
            // leaving a job pointing at a node the registration just reset.
            let mut job_stmt = conn.prepare(
                "SELECT id FROM jobs WHERE node_id = ?1 AND status IN ('assigned', 'running')",
            )?;
            let bound_jobs: Vec<String> = job_stmt
                .query_map(params![id_str], |r| r.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            drop(job_stmt);
            for job_id_str in bound_jobs {
                if let Ok(job_id) = job_id_str.parse::<Uuid>() {
                    if let Ok(mut job) = load_job(&conn, job_id) {
                        job.retry_count += 1;
                        job.node_id = None;
                        job.assigned_at = None;
                        job.started_at = None;
                        if job.retry_count > job.max_retries {
                            job.status = JobStatus::Failed;
                            job.failure_reason = Some(FailureReason::PlatformError);
                            job.completed_at = Some(Utc::now());
                        } else {
                            job.status = JobStatus::Queued;
                        }
                        let _ = update_job_row(&conn, &job);
                    }
                }
            }

            conn.execute(
                "UPDATE nodes SET status = 'available', hardware_json = ?1,
                    last_heartbeat_ms = ?2, current_job_id = NULL
                 WHERE id = ?3",
                params![hw_json, now.timestamp_millis(), id_str],
            )?;
            let node = load_node(&conn, id)?;
            Ok((node, false))
        } else {
            let node = Node::new(address.to_string(), hardware.clone());
            let hw_json = serde_json::to_string(&node.hardware).map_err(|e| StoreError::internal(e.to_string()))?;
            conn.execute(
                "INSERT INTO nodes (id, address, status, current_job_id, registered_at_ms, last_heartbeat_ms, hardware_json)
                 VALUES (?1, ?2, 'available', NULL, ?3, ?4, ?5)",
                params![
                    node.id.to_string(),
                    node.address,
                    node.registered_at.timestamp_millis(),
                    node.last_heartbeat.timestamp_millis(),
                    hw_json,
                ],
            )?;
            Ok((node, true))
        }
    }

    pub fn heartbeat(&self, node_id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE nodes SET last_heartbeat_ms = ?1 WHERE id = ?2",
            params![Utc::now().timestamp_millis(), node_id.to_string()],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("node {node_id}")));
        }
        Ok(())
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, address, status, current_job_id, registered_at_ms, last_heartbeat_ms, hardware_json
             FROM nodes ORDER BY registered_at_ms ASC",
        )?;
        let rows = stmt.query_map([], row_to_node)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Marks nodes whose last heartbeat is older than `stale_after` as
    /// Offline, and reclaims any job they were running back onto the
    /// queue (bumping its retry count, failing it outright past
    /// max_retries). Returns the number of nodes reclaimed.
    pub fn reclaim_stale_nodes(&self, stale_after: ChronoDuration) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let cutoff = (Utc::now() - stale_after).timestamp_millis();

        let mut stmt = conn.prepare(
            "SELECT id FROM nodes WHERE status != 'offline' AND last_heartbeat_ms < ?1",
        )?;
        let stale: Vec<String> = stmt
            .query_map(params![cutoff], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        for node_id_str in &stale {
            conn.execute(
                "UPDATE nodes SET status = 'offline', current_job_id = NULL WHERE id = ?1",
                params![node_id_str],
            )?;

            let mut job_stmt = conn.prepare(
                "SELECT id FROM jobs WHERE node_id = ?1 AND status IN ('assigned', 'running')",
            )?;
            let bound_jobs: Vec<String> = job_stmt
                .query_map(params![node_id_str], |r| r.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            drop(job_stmt);

            for job_id_str in bound_jobs {
                if let Ok(job_id) = job_id_str.parse::<Uuid>() {
                    if let Ok(mut job) = load_job(&conn, job_id) {
                        if !job.status.is_terminal() {
                            job.retry_count += 1;
                            job.node_id = None;
                            job.assigned_at = None;
                            job.started_at = None;
                            if job.retry_count > job.max_retries {
                                job.status = JobStatus::Failed;
                                job.failure_reason = Some(FailureReason::PlatformError);
                                job.completed_at = Some(Utc::now());
                            } else {
                                job.status = JobStatus::Queued;
                            }
                            let _ = update_job_row(&conn, &job);
                        }
                    }
                }
            }
        }

        Ok(stale.len())
    }

    /// Deletes terminal jobs older than `retain_for`. Returns rows deleted.
    pub fn sweep_terminal_jobs(&self, retain_for: ChronoDuration) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let cutoff = (Utc::now() - retain_for).timestamp_millis();
        let deleted = conn.execute(
            "DELETE FROM jobs
             WHERE status IN ('completed', 'failed', 'canceled')
               AND completed_at_ms IS NOT NULL
               AND completed_at_ms < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    pub fn vacuum(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }
}

// ============================================================================
// ROW <-> DOMAIN HELPERS
// ============================================================================

fn insert_job(conn: &Connection, job: &Job) -> Result<(), StoreError> {
    let json = serde_json::to_string(job).map_err(|e| StoreError::internal(e.to_string()))?;
    conn.execute(
        "INSERT INTO jobs (id, scenario, status, queue, priority, classification, engine,
            retry_count, max_retries, node_id, created_at_ms, assigned_at_ms, started_at_ms,
            completed_at_ms, full_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            job.id.to_string(),
            job.scenario,
            job.status.as_str(),
            queue_str(job.queue),
            priority_str(job.priority),
            classification_str(job.classification),
            engine_str(job.engine),
            job.retry_count,
            job.max_retries,
            job.node_id.map(|n| n.to_string()),
            job.created_at.timestamp_millis(),
            job.assigned_at.map(|t| t.timestamp_millis()),
            job.started_at.map(|t| t.timestamp_millis()),
            job.completed_at.map(|t| t.timestamp_millis()),
            json,
        ],
    )?;
    Ok(())
}

fn update_job_row(conn: &Connection, job: &Job) -> Result<(), StoreError> {
    let json = serde_json::to_string(job).map_err(|e| StoreError::internal(e.to_string()))?;
    conn.execute(
        "UPDATE jobs SET status = ?1, queue = ?2, priority = ?3, retry_count = ?4,
            node_id = ?5, assigned_at_ms = ?6, started_at_ms = ?7, completed_at_ms = ?8,
            full_json = ?9
         WHERE id = ?10",
        params![
            job.status.as_str(),
            queue_str(job.queue),
            priority_str(job.priority),
            job.retry_count,
            job.node_id.map(|n| n.to_string()),
            job.assigned_at.map(|t| t.timestamp_millis()),
            job.started_at.map(|t| t.timestamp_millis()),
            job.completed_at.map(|t| t.timestamp_millis()),
            json,
            job.id.to_string(),
        ],
    )?;
    Ok(())
}

fn load_job(conn: &Connection, job_id: Uuid) -> Result<Job, StoreError> {
    let json: String = conn
        .query_row(
            "SELECT full_json FROM jobs WHERE id = ?1",
            params![job_id.to_string()],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
    serde_json::from_str(&json).map_err(|e| StoreError::internal(e.to_string()))
}

/// The true count of jobs bound to `node_id`, queried directly against
/// `jobs` rather than trusted from the single-valued `nodes.current_job_id`
/// scalar — a node's `max_concurrent_jobs` can exceed one.
fn active_job_count(conn: &Connection, node_id: Uuid) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE node_id = ?1 AND status IN ('assigned', 'running')",
        params![node_id.to_string()],
        |r| r.get(0),
    )?;
    Ok(count as usize)
}

/// Sets a node back to `available` (clearing `current_job_id`) when it no
/// longer has any job bound to it, or refreshes `current_job_id` to one of
/// its remaining jobs otherwise. Called whenever a job bound to a node
/// leaves the assigned/running set.
fn refresh_node_status(conn: &Connection, node_id: Uuid) -> Result<(), StoreError> {
    let remaining: Option<String> = conn
        .query_row(
            "SELECT id FROM jobs WHERE node_id = ?1 AND status IN ('assigned', 'running') LIMIT 1",
            params![node_id.to_string()],
            |r| r.get(0),
        )
        .optional()?;

    match remaining {
        Some(job_id) => {
            conn.execute(
                "UPDATE nodes SET current_job_id = ?1 WHERE id = ?2 AND status != 'offline'",
                params![job_id, node_id.to_string()],
            )?;
        }
        None => {
            conn.execute(
                "UPDATE nodes SET status = 'available', current_job_id = NULL
                 WHERE id = ?1 AND status != 'offline'",
                params![node_id.to_string()],
            )?;
        }
    }
    Ok(())
}

fn load_node(conn: &Connection, node_id: Uuid) -> Result<Node, StoreError> {
    conn.query_row(
        "SELECT id, address, status, current_job_id, registered_at_ms, last_heartbeat_ms, hardware_json
         FROM nodes WHERE id = ?1",
        params![node_id.to_string()],
        row_to_node,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))
}

fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<Node> {
    let id: String = row.get(0)?;
    let address: String = row.get(1)?;
    let status: String = row.get(2)?;
    let current_job_id: Option<String> = row.get(3)?;
    let registered_at_ms: i64 = row.get(4)?;
    let last_heartbeat_ms: i64 = row.get(5)?;
    let hardware_json: String = row.get(6)?;

    let hardware: HardwareDescriptor = serde_json::from_str(&hardware_json).unwrap_or(HardwareDescriptor {
        cpu_threads: 0,
        cpu_model: "unknown".into(),
        ram_mb: 0,
        gpu_type: None,
        gpu_count: 0,
        node_class: NodeClass::Server,
        tags: vec![],
        engines: vec![],
    });

    Ok(Node {
        id: id.parse().unwrap_or_else(|_| Uuid::nil()),
        address,
        hardware,
        status: match status.as_str() {
            "available" => NodeStatus::Available,
            "busy" => NodeStatus::Busy,
            _ => NodeStatus::Offline,
        },
        current_job_id: current_job_id.and_then(|s| s.parse().ok()),
        registered_at: ms_to_datetime(registered_at_ms),
        last_heartbeat: ms_to_datetime(last_heartbeat_ms),
    })
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn queue_str(q: Queue) -> &'static str {
    match q {
        Queue::Live => "live",
        Queue::Batch => "batch",
        Queue::Default => "default",
    }
}

fn priority_str(p: Priority) -> &'static str {
    match p {
        Priority::High => "high",
        Priority::Normal => "normal",
        Priority::Low => "low",
    }
}

fn classification_str(c: Classification) -> &'static str {
    match c {
        Classification::Production => "production",
        Classification::Test => "test",
        Classification::Benchmark => "benchmark",
        Classification::Debug => "debug",
    }
}

fn engine_str(e: EnginePreference) -> &'static str {
    match e {
        EnginePreference::Auto => "auto",
        EnginePreference::Ffmpeg => "ffmpeg",
        EnginePreference::Gstreamer => "gstreamer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Classification, EnginePreference, Priority};

    fn temp_store() -> (JobStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        (JobStore::open(path).unwrap(), dir)
    }

    fn sample_job() -> Job {
        Job::new(
            "transcode".into(),
            serde_json::json!({"src": "a.mp4"}),
            Classification::Production,
            EnginePreference::Auto,
            Queue::Default,
            Priority::Normal,
            crate::core::HardwareRequirements::default(),
            3,
        )
    }

    fn sample_hw() -> HardwareDescriptor {
        HardwareDescriptor {
            cpu_threads: 8,
            cpu_model: "test".into(),
            ram_mb: 8192,
            gpu_type: None,
            gpu_count: 0,
            node_class: NodeClass::Desktop,
            tags: vec![],
            engines: vec!["ffmpeg".into(), "gstreamer".into()],
        }
    }

    #[test]
    fn enqueue_then_get_next_job_assigns_exactly_once() {
        let (store, _dir) = temp_store();
        let job = sample_job();
        store.create_job(&job).unwrap();
        store.enqueue(job.id).unwrap();

        let node = store.register_node("127.0.0.1:9000", &sample_hw()).unwrap().0;

        let claimed = store.get_next_job(node.id, 1).unwrap().expect("job available");
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Assigned);

        assert!(store.get_next_job(node.id, 1).unwrap().is_none());
    }

    #[test]
    fn get_next_job_respects_free_slots_capacity() {
        let (store, _dir) = temp_store();
        let job_a = sample_job();
        let job_b = sample_job();
        for j in [&job_a, &job_b] {
            store.create_job(j).unwrap();
            store.enqueue(j.id).unwrap();
        }
        let node = store.register_node("127.0.0.1:9100", &sample_hw()).unwrap().0;

        assert!(store.get_next_job(node.id, 1).unwrap().is_some());
        // Node already has one job in flight; free_slots=1 means no room left.
        assert!(store.get_next_job(node.id, 1).unwrap().is_none());
        // With two declared slots, the second job is still claimable.
        assert!(store.get_next_job(node.id, 2).unwrap().is_some());
    }

    #[test]
    fn get_next_job_rejects_node_missing_required_engine_without_fallback() {
        let (store, _dir) = temp_store();
        let job = Job::new(
            "transcode".into(),
            serde_json::json!({}),
            Classification::Production,
            EnginePreference::Ffmpeg,
            Queue::Default,
            Priority::Normal,
            crate::core::HardwareRequirements::default(),
            3,
        );
        store.create_job(&job).unwrap();
        store.enqueue(job.id).unwrap();

        let hw_no_ffmpeg = HardwareDescriptor {
            cpu_threads: 4,
            cpu_model: "test".into(),
            ram_mb: 4096,
            gpu_type: None,
            gpu_count: 0,
            node_class: NodeClass::Laptop,
            tags: vec![],
            engines: vec!["gstreamer".into()],
        };
        let node = store.register_node("127.0.0.1:9200", &hw_no_ffmpeg).unwrap().0;
        assert!(store.get_next_job(node.id, 1).unwrap().is_none());
    }

    #[test]
    fn get_next_job_rejects_node_missing_hardware_requirements() {
        let (store, _dir) = temp_store();
        let job = Job::new(
            "transcode".into(),
            serde_json::json!({}),
            Classification::Production,
            EnginePreference::Auto,
            Queue::Default,
            Priority::Normal,
            crate::core::HardwareRequirements { requires_gpu: true, ..Default::default() },
            3,
        );
        store.create_job(&job).unwrap();
        store.enqueue(job.id).unwrap();

        let node = store.register_node("127.0.0.1:9300", &sample_hw()).unwrap().0;
        assert!(store.get_next_job(node.id, 1).unwrap().is_none());
    }

    #[test]
    fn n_concurrent_callers_award_m_queued_jobs_exactly_once() {
        use std::collections::HashSet;
        use std::sync::{Arc, Mutex};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("test.db")).unwrap());

        const JOB_COUNT: usize = 12;
        const NODE_COUNT: usize = 5;

        let mut job_ids = Vec::new();
        for _ in 0..JOB_COUNT {
            let job = sample_job();
            store.create_job(&job).unwrap();
            store.enqueue(job.id).unwrap();
            job_ids.push(job.id);
        }

        let mut node_ids = Vec::new();
        for i in 0..NODE_COUNT {
            let (node, _) = store.register_node(&format!("10.1.0.{i}:9000"), &sample_hw()).unwrap();
            node_ids.push(node.id);
        }

        let awarded = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = node_ids
            .into_iter()
            .map(|node_id| {
                let store = store.clone();
                let awarded = awarded.clone();
                std::thread::spawn(move || {
                    loop {
                        match store.get_next_job(node_id, JOB_COUNT) {
                            Ok(Some(job)) => awarded.lock().unwrap().push(job.id),
                            Ok(None) => break,
                            Err(_) => break,
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let awarded = awarded.lock().unwrap();
        assert_eq!(awarded.len(), JOB_COUNT, "every job must be awarded exactly once total");
        let unique: HashSet<_> = awarded.iter().collect();
        assert_eq!(unique.len(), JOB_COUNT, "no job may be awarded to more than one caller");
        for id in &job_ids {
            assert!(unique.contains(id));
        }
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let (store, _dir) = temp_store();
        let job = sample_job();
        store.create_job(&job).unwrap();
        let err = store
            .update_job_status(job.id, JobStatus::Running, None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[test]
    fn re_registration_preserves_node_identity() {
        let (store, _dir) = temp_store();
        let hw = sample_hw();
        let (first, created) = store.register_node("10.0.0.1:9000", &hw).unwrap();
        assert!(created);
        let (second, created_again) = store.register_node("10.0.0.1:9000", &hw).unwrap();
        assert!(!created_again);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn completing_a_job_frees_its_node_back_to_available() {
        let (store, _dir) = temp_store();
        let job = sample_job();
        store.create_job(&job).unwrap();
        store.enqueue(job.id).unwrap();

        let (node, _) = store.register_node("10.0.0.9:9000", &sample_hw()).unwrap();
        store.get_next_job(node.id, 1).unwrap();
        store.update_job_status(job.id, JobStatus::Running, None, None).unwrap();
        store.update_job_status(job.id, JobStatus::Completed, None, None).unwrap();

        let node_after = store.list_nodes().unwrap().into_iter().find(|n| n.id == node.id).unwrap();
        assert_eq!(node_after.status, NodeStatus::Available);
        assert!(node_after.current_job_id.is_none());
    }

    #[test]
    fn reclaim_requeues_job_and_bumps_retry_count() {
        let (store, _dir) = temp_store();
        let job = sample_job();
        store.create_job(&job).unwrap();
        store.enqueue(job.id).unwrap();

        let hw = sample_hw();
        let (node, _) = store.register_node("10.0.0.2:9000", &hw).unwrap();
        store.get_next_job(node.id, 1).unwrap();

        // Force the node stale by reclaiming with a zero threshold.
        let reclaimed = store.reclaim_stale_nodes(ChronoDuration::seconds(-1)).unwrap();
        assert_eq!(reclaimed, 1);

        let job_after = store.get_job(job.id).unwrap();
        assert_eq!(job_after.status, JobStatus::Queued);
        assert_eq!(job_after.retry_count, 1);
        assert!(job_after.node_id.is_none());
    }
}
