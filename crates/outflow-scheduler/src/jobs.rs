//! Job definitions — the data model for durable delayed work.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// What a job does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Reactivate a paused workflow at its resume node.
    ResumeWorkflow,
    /// Send one queued connection request.
    SendInvite,
    /// Send a queued workflow email.
    SendEmail,
    /// Recurring scan for invites past their TTL.
    InviteSweep,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ResumeWorkflow => "resume_workflow",
            JobKind::SendInvite => "send_invite",
            JobKind::SendEmail => "send_email",
            JobKind::InviteSweep => "invite_sweep",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "resume_workflow" => Some(JobKind::ResumeWorkflow),
            "send_invite" => Some(JobKind::SendInvite),
            "send_email" => Some(JobKind::SendEmail),
            "invite_sweep" => Some(JobKind::InviteSweep),
            _ => None,
        }
    }
}

/// Job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    /// Attempts exhausted or a non-retryable error; kept for manual review.
    Parked,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Parked => "parked",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => JobState::Running,
            "completed" => JobState::Completed,
            "parked" => JobState::Parked,
            _ => JobState::Queued,
        }
    }
}

/// A durable job.
#[derive(Debug, Clone)]
pub struct Job {
    /// Deterministic dedup key; doubles as the primary key.
    pub id: String,
    pub kind: JobKind,
    pub conversation_id: Option<String>,
    pub account_id: Option<String>,
    pub node_id: Option<String>,
    pub payload: serde_json::Value,
    pub run_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// For recurring jobs: reschedule this many seconds after completion.
    pub repeat_secs: Option<u64>,
    pub state: JobState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Deterministic id for a job scoped to a conversation (and optionally
    /// one node). Identical inputs always produce the identical id, which
    /// is what collapses duplicate enqueues.
    pub fn dedup_key(kind: JobKind, conversation_id: &str, node_id: Option<&str>) -> String {
        match node_id {
            Some(node) => format!("{}:{}:{}", kind.as_str(), conversation_id, node),
            None => format!("{}:{}", kind.as_str(), conversation_id),
        }
    }

    /// Deterministic id for an account-scoped job.
    pub fn account_key(kind: JobKind, account_id: &str, discriminator: &str) -> String {
        format!("{}:{}:{}", kind.as_str(), account_id, discriminator)
    }

    /// A resume job carrying the resume-node snapshot.
    pub fn resume(conversation_id: &str, node_id: &str, delay: Duration) -> Self {
        Self {
            id: Self::dedup_key(JobKind::ResumeWorkflow, conversation_id, Some(node_id)),
            kind: JobKind::ResumeWorkflow,
            conversation_id: Some(conversation_id.to_string()),
            account_id: None,
            node_id: Some(node_id.to_string()),
            payload: serde_json::Value::Null,
            run_at: Utc::now() + delay,
            attempts: 0,
            max_attempts: 3,
            repeat_secs: None,
            state: JobState::Queued,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// A one-shot job with an arbitrary payload.
    pub fn once(id: String, kind: JobKind, payload: serde_json::Value, run_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            conversation_id: None,
            account_id: None,
            node_id: None,
            payload,
            run_at,
            attempts: 0,
            max_attempts: 3,
            repeat_secs: None,
            state: JobState::Queued,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// A recurring job (first run after one interval).
    pub fn recurring(id: String, kind: JobKind, every_secs: u64) -> Self {
        Self {
            id,
            kind,
            conversation_id: None,
            account_id: None,
            node_id: None,
            payload: serde_json::Value::Null,
            run_at: Utc::now() + Duration::seconds(every_secs as i64),
            attempts: 0,
            max_attempts: 3,
            repeat_secs: Some(every_secs),
            state: JobState::Queued,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_account(mut self, account_id: &str) -> Self {
        self.account_id = Some(account_id.to_string());
        self
    }

    pub fn with_conversation(mut self, conversation_id: &str) -> Self {
        self.conversation_id = Some(conversation_id.to_string());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Exponential backoff policy applied to retryable failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 10,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-indexed): base * 2^(attempt-1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1).min(16));
        Duration::seconds((self.base_delay_secs.saturating_mul(factor)) as i64)
    }
}
