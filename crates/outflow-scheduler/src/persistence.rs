//! SQLite-backed job store — survives restarts, safe across workers.
//!
//! Claiming is a single conditional UPDATE (queued → running), so two
//! workers polling the same database never double-claim a job.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use outflow_core::error::{OutflowError, Result};

use crate::jobs::{Job, JobKind, JobState, RetryPolicy};

/// Counts per queue set.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    /// Due now or overdue.
    pub waiting: u32,
    /// Scheduled for the future.
    pub delayed: u32,
    pub running: u32,
    pub completed: u32,
    /// Terminally failed, kept for manual review.
    pub parked: u32,
}

pub struct JobStore {
    conn: Mutex<Connection>,
}

fn store_err<E: std::fmt::Display>(e: E) -> OutflowError {
    OutflowError::Store(e.to_string())
}

impl JobStore {
    /// Open or create the job database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store (tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,          -- deterministic dedup key
                kind TEXT NOT NULL,
                conversation_id TEXT,
                account_id TEXT,
                node_id TEXT,
                payload TEXT NOT NULL DEFAULT 'null',
                run_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                repeat_secs INTEGER,
                state TEXT NOT NULL DEFAULT 'queued',
                last_error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(state, run_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_conversation ON jobs(conversation_id);
            ",
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(store_err)
    }

    /// Enqueue a job. Returns `false` when a live job with the same id
    /// already exists (the duplicate collapses). Completed/parked rows with
    /// the same id are replaced so a conversation can wait at the same node
    /// again in a later pass.
    pub fn enqueue(&self, job: &Job) -> Result<bool> {
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row("SELECT state FROM jobs WHERE id = ?1", [&job.id], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(store_err(other)),
            })?;
        if let Some(state) = existing {
            match JobState::parse(&state) {
                JobState::Queued | JobState::Running => return Ok(false),
                JobState::Completed | JobState::Parked => {
                    conn.execute("DELETE FROM jobs WHERE id = ?1", [&job.id])
                        .map_err(store_err)?;
                }
            }
        }
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO jobs
                 (id, kind, conversation_id, account_id, node_id, payload, run_at,
                  attempts, max_attempts, repeat_secs, state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'queued', ?11)",
                rusqlite::params![
                    job.id,
                    job.kind.as_str(),
                    job.conversation_id,
                    job.account_id,
                    job.node_id,
                    job.payload.to_string(),
                    job.run_at.to_rfc3339(),
                    job.attempts,
                    job.max_attempts,
                    job.repeat_secs,
                    job.created_at.to_rfc3339()
                ],
            )
            .map_err(store_err)?;
        Ok(inserted > 0)
    }

    /// Claim up to `limit` due jobs: queued → running in one UPDATE each.
    pub fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM jobs
                 WHERE state = 'queued' AND run_at <= ?1
                 ORDER BY run_at ASC LIMIT ?2",
            )
            .map_err(store_err)?;
        let ids: Vec<String> = stmt
            .query_map(rusqlite::params![now.to_rfc3339(), limit as i64], |row| {
                row.get(0)
            })
            .map_err(store_err)?
            .collect::<std::result::Result<_, _>>()
            .map_err(store_err)?;

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let updated = conn
                .execute(
                    "UPDATE jobs SET state = 'running', attempts = attempts + 1
                     WHERE id = ?1 AND state = 'queued'",
                    [&id],
                )
                .map_err(store_err)?;
            if updated == 0 {
                continue; // another worker won the claim
            }
            if let Some(job) = Self::load_row(&conn, &id)? {
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    /// Mark a job done. Recurring jobs are rescheduled one interval out.
    pub fn complete(&self, job_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let repeat: Option<i64> = conn
            .query_row(
                "SELECT repeat_secs FROM jobs WHERE id = ?1",
                [job_id],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(store_err(other)),
            })?;
        match repeat {
            Some(secs) => {
                let next = Utc::now() + chrono::Duration::seconds(secs);
                conn.execute(
                    "UPDATE jobs SET state = 'queued', attempts = 0, last_error = NULL,
                            run_at = ?1
                     WHERE id = ?2",
                    rusqlite::params![next.to_rfc3339(), job_id],
                )
                .map_err(store_err)?;
            }
            None => {
                conn.execute(
                    "UPDATE jobs SET state = 'completed', last_error = NULL WHERE id = ?1",
                    [job_id],
                )
                .map_err(store_err)?;
            }
        }
        Ok(())
    }

    /// Record a failure: reschedule with backoff while attempts remain and
    /// the error is retryable; park otherwise.
    pub fn fail(
        &self,
        job: &Job,
        error: &str,
        retryable: bool,
        policy: &RetryPolicy,
    ) -> Result<JobState> {
        let conn = self.lock()?;
        if retryable && job.attempts < job.max_attempts {
            let next = Utc::now() + policy.backoff(job.attempts);
            conn.execute(
                "UPDATE jobs SET state = 'queued', last_error = ?1, run_at = ?2 WHERE id = ?3",
                rusqlite::params![error, next.to_rfc3339(), job.id],
            )
            .map_err(store_err)?;
            Ok(JobState::Queued)
        } else {
            conn.execute(
                "UPDATE jobs SET state = 'parked', last_error = ?1 WHERE id = ?2",
                rusqlite::params![error, job.id],
            )
            .map_err(store_err)?;
            Ok(JobState::Parked)
        }
    }

    /// Remove queued/delayed jobs for a conversation (an inbound reply made
    /// the scheduled wait obsolete). Running jobs are left alone.
    pub fn cancel_for_conversation(&self, conversation_id: &str) -> Result<u32> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM jobs WHERE conversation_id = ?1 AND state = 'queued'",
                [conversation_id],
            )
            .map_err(store_err)?;
        Ok(removed as u32)
    }

    /// Remove every job of a kind scoped to an account — used when the
    /// referenced resource is gone for good.
    pub fn remove_for_account(&self, account_id: &str) -> Result<u32> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM jobs WHERE account_id = ?1 AND state IN ('queued', 'parked')",
                [account_id],
            )
            .map_err(store_err)?;
        Ok(removed as u32)
    }

    pub fn job(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.lock()?;
        Self::load_row(&conn, job_id)
    }

    /// Jobs due now or overdue.
    pub fn waiting(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        self.list("state = 'queued' AND run_at <= ?1", Some(now))
    }

    /// Jobs scheduled for the future.
    pub fn delayed(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        self.list("state = 'queued' AND run_at > ?1", Some(now))
    }

    /// Parked jobs awaiting manual review.
    pub fn failed(&self) -> Result<Vec<Job>> {
        self.list("state = 'parked'", None)
    }

    pub fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        Ok(QueueStats {
            waiting: self.waiting(now)?.len() as u32,
            delayed: self.delayed(now)?.len() as u32,
            running: self.list("state = 'running'", None)?.len() as u32,
            completed: self.list("state = 'completed'", None)?.len() as u32,
            parked: self.failed()?.len() as u32,
        })
    }

    fn list(&self, where_clause: &str, now: Option<DateTime<Utc>>) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT id, kind, conversation_id, account_id, node_id, payload, run_at,
                    attempts, max_attempts, repeat_secs, state, last_error, created_at
             FROM jobs WHERE {where_clause} ORDER BY run_at ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let map = |row: &rusqlite::Row<'_>| Self::map_row(row);
        let rows = match now {
            Some(ts) => stmt
                .query_map([ts.to_rfc3339()], map)
                .map_err(store_err)?
                .collect::<std::result::Result<Vec<_>, _>>(),
            None => stmt
                .query_map([], map)
                .map_err(store_err)?
                .collect::<std::result::Result<Vec<_>, _>>(),
        };
        rows.map_err(store_err)
    }

    fn load_row(conn: &Connection, job_id: &str) -> Result<Option<Job>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, kind, conversation_id, account_id, node_id, payload, run_at,
                        attempts, max_attempts, repeat_secs, state, last_error, created_at
                 FROM jobs WHERE id = ?1",
            )
            .map_err(store_err)?;
        stmt.query_row([job_id], Self::map_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(store_err(other)),
            })
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
        let kind_str: String = row.get(1)?;
        let payload_str: String = row.get(5)?;
        let run_at_str: String = row.get(6)?;
        let state_str: String = row.get(10)?;
        let created_str: String = row.get(12)?;
        Ok(Job {
            id: row.get(0)?,
            kind: JobKind::parse(&kind_str).unwrap_or(JobKind::ResumeWorkflow),
            conversation_id: row.get(2)?,
            account_id: row.get(3)?,
            node_id: row.get(4)?,
            payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
            run_at: parse_ts(&run_at_str),
            attempts: row.get(7)?,
            max_attempts: row.get(8)?,
            repeat_secs: row.get::<_, Option<i64>>(9)?.map(|s| s as u64),
            state: JobState::parse(&state_str),
            last_error: row.get(11)?,
            created_at: parse_ts(&created_str),
        })
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn due_job(id_suffix: &str) -> Job {
        let mut job = Job::resume("conv-1", id_suffix, Duration::seconds(0));
        job.run_at = Utc::now() - Duration::seconds(1);
        job
    }

    #[test]
    fn test_duplicate_enqueue_collapses() {
        let store = JobStore::open_in_memory().unwrap();
        let job = Job::resume("conv-1", "n4", Duration::hours(24));
        assert!(store.enqueue(&job).unwrap());
        assert!(!store.enqueue(&job).unwrap());
        assert_eq!(store.delayed(Utc::now()).unwrap().len(), 1);
    }

    #[test]
    fn test_claim_once() {
        let store = JobStore::open_in_memory().unwrap();
        store.enqueue(&due_job("n1")).unwrap();

        let first = store.claim_due(Utc::now(), 10).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempts, 1);

        // Already running: nothing left to claim.
        assert!(store.claim_due(Utc::now(), 10).unwrap().is_empty());
    }

    #[test]
    fn test_retry_then_park() {
        let store = JobStore::open_in_memory().unwrap();
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_secs: 0,
        };
        store.enqueue(&due_job("n1").with_max_attempts(2)).unwrap();

        let job = store.claim_due(Utc::now(), 1).unwrap().pop().unwrap();
        assert_eq!(store.fail(&job, "timeout", true, &policy).unwrap(), JobState::Queued);

        let job = store.claim_due(Utc::now(), 1).unwrap().pop().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(store.fail(&job, "timeout", true, &policy).unwrap(), JobState::Parked);

        let failed = store.failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_non_retryable_parks_immediately() {
        let store = JobStore::open_in_memory().unwrap();
        let policy = RetryPolicy::default();
        store.enqueue(&due_job("n1")).unwrap();
        let job = store.claim_due(Utc::now(), 1).unwrap().pop().unwrap();
        assert_eq!(
            store.fail(&job, "missing url", false, &policy).unwrap(),
            JobState::Parked
        );
    }

    #[test]
    fn test_cancel_for_conversation() {
        let store = JobStore::open_in_memory().unwrap();
        store
            .enqueue(&Job::resume("conv-1", "n4", Duration::hours(1)))
            .unwrap();
        store
            .enqueue(&Job::resume("conv-2", "n4", Duration::hours(1)))
            .unwrap();

        assert_eq!(store.cancel_for_conversation("conv-1").unwrap(), 1);
        let delayed = store.delayed(Utc::now()).unwrap();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].conversation_id.as_deref(), Some("conv-2"));
    }

    #[test]
    fn test_recurring_reschedules_on_complete() {
        let store = JobStore::open_in_memory().unwrap();
        let mut job = Job::recurring("invite_sweep:global".into(), JobKind::InviteSweep, 3600);
        job.run_at = Utc::now() - Duration::seconds(1);
        store.enqueue(&job).unwrap();

        let claimed = store.claim_due(Utc::now(), 1).unwrap().pop().unwrap();
        store.complete(&claimed.id).unwrap();

        // Back in the delayed set, one interval out.
        let delayed = store.delayed(Utc::now()).unwrap();
        assert_eq!(delayed.len(), 1);
        assert!(delayed[0].run_at > Utc::now() + Duration::seconds(3000));
    }

    #[test]
    fn test_completed_id_can_be_reused() {
        let store = JobStore::open_in_memory().unwrap();
        store.enqueue(&due_job("n1")).unwrap();
        let job = store.claim_due(Utc::now(), 1).unwrap().pop().unwrap();
        store.complete(&job.id).unwrap();

        // The same conversation can wait at the same node in a later pass.
        assert!(store.enqueue(&due_job("n1")).unwrap());
    }
}
