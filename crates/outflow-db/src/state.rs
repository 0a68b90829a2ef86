//! Workflow state persistence — one row per conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use outflow_core::error::{OutflowError, Result};

use crate::{Store, store_err};

/// Lifecycle of a conversation's workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Paused,
    Completed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Active => "active",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "paused" => WorkflowStatus::Paused,
            "completed" => WorkflowStatus::Completed,
            _ => WorkflowStatus::Active,
        }
    }
}

/// One executed node in a conversation's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub node_id: String,
    pub node_type: String,
    /// Identity of the event delivery that ran this node; replayed
    /// deliveries carry the same key and are skipped for effectful nodes.
    pub event_key: String,
    pub executed_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub result: serde_json::Value,
}

/// Persisted workflow state for a conversation.
#[derive(Debug, Clone)]
pub struct WorkflowStateRecord {
    pub conversation_id: String,
    pub agent_id: i64,
    pub status: WorkflowStatus,
    pub current_node_id: Option<String>,
    pub resume_node_id: Option<String>,
    pub paused_reason: Option<String>,
    pub paused_until: Option<DateTime<Utc>>,
    pub resume_job_id: Option<String>,
    pub variables: HashMap<String, serde_json::Value>,
    pub step_history: Vec<StepRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStateRecord {
    /// Whether `node_id` already ran successfully for this event delivery.
    pub fn has_step(&self, node_id: &str, event_key: &str) -> bool {
        self.step_history
            .iter()
            .any(|s| s.node_id == node_id && s.event_key == event_key && s.success)
    }

    /// Whether `node_id` has ever run (any event).
    pub fn has_executed(&self, node_id: &str) -> bool {
        self.step_history.iter().any(|s| s.node_id == node_id)
    }
}

impl Store {
    /// Create the state row for a conversation, positioned at its trigger.
    /// Creating twice is a no-op; the existing row is returned.
    pub fn init_workflow_state(
        &self,
        conversation_id: &str,
        agent_id: i64,
        current_node_id: Option<&str>,
    ) -> Result<WorkflowStateRecord> {
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR IGNORE INTO workflow_state
                 (conversation_id, agent_id, status, current_node_id, created_at, updated_at)
                 VALUES (?1, ?2, 'active', ?3, ?4, ?4)",
                rusqlite::params![conversation_id, agent_id, current_node_id, now],
            )
            .map_err(store_err)?;
        }
        self.workflow_state(conversation_id)?.ok_or_else(|| {
            OutflowError::StateInconsistency(format!(
                "workflow state vanished for conversation {conversation_id}"
            ))
        })
    }

    /// Load a conversation's workflow state.
    pub fn workflow_state(&self, conversation_id: &str) -> Result<Option<WorkflowStateRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, agent_id, status, current_node_id, resume_node_id,
                        paused_reason, paused_until, resume_job_id, variables, step_history,
                        created_at, updated_at
                 FROM workflow_state WHERE conversation_id = ?1",
            )
            .map_err(store_err)?;

        let row = stmt
            .query_row([conversation_id], |row| {
                let variables_json: String = row.get(8)?;
                let history_json: String = row.get(9)?;
                Ok(WorkflowStateRecord {
                    conversation_id: row.get(0)?,
                    agent_id: row.get(1)?,
                    status: WorkflowStatus::parse(&row.get::<_, String>(2)?),
                    current_node_id: row.get(3)?,
                    resume_node_id: row.get(4)?,
                    paused_reason: row.get(5)?,
                    paused_until: parse_ts_opt(row.get::<_, Option<String>>(6)?),
                    resume_job_id: row.get(7)?,
                    variables: serde_json::from_str(&variables_json).unwrap_or_default(),
                    step_history: serde_json::from_str(&history_json).unwrap_or_default(),
                    created_at: parse_ts(&row.get::<_, String>(10)?),
                    updated_at: parse_ts(&row.get::<_, String>(11)?),
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(store_err(other)),
            })?;

        Ok(row)
    }

    /// Move the cursor to a new node.
    pub fn update_current_node(&self, conversation_id: &str, node_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE workflow_state SET current_node_id = ?1, updated_at = ?2
             WHERE conversation_id = ?3",
            rusqlite::params![node_id, Utc::now().to_rfc3339(), conversation_id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Merge a single workflow variable.
    pub fn set_workflow_variable(
        &self,
        conversation_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let Some(state) = self.workflow_state(conversation_id)? else {
            return Err(OutflowError::StateInconsistency(format!(
                "no workflow state for conversation {conversation_id}"
            )));
        };
        let mut variables = state.variables;
        variables.insert(key.to_string(), value.clone());
        let conn = self.lock()?;
        conn.execute(
            "UPDATE workflow_state SET variables = ?1, updated_at = ?2
             WHERE conversation_id = ?3",
            rusqlite::params![
                serde_json::to_string(&variables).map_err(store_err)?,
                Utc::now().to_rfc3339(),
                conversation_id
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Append one step to the history.
    pub fn append_step(&self, conversation_id: &str, step: &StepRecord) -> Result<()> {
        let Some(state) = self.workflow_state(conversation_id)? else {
            return Err(OutflowError::StateInconsistency(format!(
                "no workflow state for conversation {conversation_id}"
            )));
        };
        let mut history = state.step_history;
        history.push(step.clone());
        let conn = self.lock()?;
        conn.execute(
            "UPDATE workflow_state SET step_history = ?1, updated_at = ?2
             WHERE conversation_id = ?3",
            rusqlite::params![
                serde_json::to_string(&history).map_err(store_err)?,
                Utc::now().to_rfc3339(),
                conversation_id
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Persist a pause: status, resume point, reason, and the resume job id.
    pub fn pause_workflow(
        &self,
        conversation_id: &str,
        paused_until: Option<DateTime<Utc>>,
        reason: &str,
        resume_node_id: &str,
        resume_job_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE workflow_state
             SET status = 'paused', paused_until = ?1, paused_reason = ?2,
                 resume_node_id = ?3, resume_job_id = ?4, updated_at = ?5
             WHERE conversation_id = ?6",
            rusqlite::params![
                paused_until.map(|t| t.to_rfc3339()),
                reason,
                resume_node_id,
                resume_job_id,
                Utc::now().to_rfc3339(),
                conversation_id
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Clear pause fields and position the cursor at the resume node.
    pub fn resume_workflow(&self, conversation_id: &str) -> Result<WorkflowStateRecord> {
        let Some(state) = self.workflow_state(conversation_id)? else {
            return Err(OutflowError::StateInconsistency(format!(
                "no workflow state for conversation {conversation_id}"
            )));
        };
        if state.status != WorkflowStatus::Paused {
            return Err(OutflowError::StateInconsistency(format!(
                "workflow for {conversation_id} is not paused"
            )));
        }
        let resume_node = state
            .resume_node_id
            .clone()
            .or(state.current_node_id.clone());
        {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE workflow_state
                 SET status = 'active', paused_until = NULL, paused_reason = NULL,
                     current_node_id = ?1, resume_node_id = NULL, resume_job_id = NULL,
                     updated_at = ?2
                 WHERE conversation_id = ?3",
                rusqlite::params![resume_node, Utc::now().to_rfc3339(), conversation_id],
            )
            .map_err(store_err)?;
        }
        self.workflow_state(conversation_id)?.ok_or_else(|| {
            OutflowError::StateInconsistency(format!(
                "workflow state vanished for conversation {conversation_id}"
            ))
        })
    }

    /// Terminal state; rows stay around as an audit trail.
    pub fn complete_workflow(&self, conversation_id: &str, reason: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE workflow_state
             SET status = 'completed', paused_reason = ?1, updated_at = ?2
             WHERE conversation_id = ?3",
            rusqlite::params![reason, Utc::now().to_rfc3339(), conversation_id],
        )
        .map_err(store_err)?;
        Ok(())
    }
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let a = store.init_workflow_state("c1", 7, Some("trigger-1")).unwrap();
        let b = store.init_workflow_state("c1", 7, Some("other")).unwrap();
        assert_eq!(a.current_node_id, b.current_node_id);
        assert_eq!(b.current_node_id.as_deref(), Some("trigger-1"));
    }

    #[test]
    fn test_pause_resume_cycle() {
        let store = Store::open_in_memory().unwrap();
        store.init_workflow_state("c2", 1, Some("n1")).unwrap();

        store
            .pause_workflow("c2", Some(Utc::now()), "wait_action", "n3", Some("job-1"))
            .unwrap();
        let paused = store.workflow_state("c2").unwrap().unwrap();
        assert_eq!(paused.status, WorkflowStatus::Paused);
        assert_eq!(paused.resume_node_id.as_deref(), Some("n3"));

        let resumed = store.resume_workflow("c2").unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Active);
        assert_eq!(resumed.current_node_id.as_deref(), Some("n3"));
        assert!(resumed.resume_node_id.is_none());
        assert!(resumed.resume_job_id.is_none());
    }

    #[test]
    fn test_paused_invariant_requires_resume_node() {
        let store = Store::open_in_memory().unwrap();
        store.init_workflow_state("c3", 1, Some("n1")).unwrap();
        store
            .pause_workflow("c3", None, "waiting_for_response", "n1", None)
            .unwrap();
        let state = store.workflow_state("c3").unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Paused);
        assert!(state.resume_node_id.is_some());
    }

    #[test]
    fn test_step_history_and_event_keys() {
        let store = Store::open_in_memory().unwrap();
        store.init_workflow_state("c4", 1, Some("n1")).unwrap();

        let step = StepRecord {
            node_id: "n2".into(),
            node_type: "action".into(),
            event_key: "resume:n2".into(),
            executed_at: Utc::now(),
            success: true,
            result: serde_json::json!({"sent": true}),
        };
        store.append_step("c4", &step).unwrap();

        let state = store.workflow_state("c4").unwrap().unwrap();
        assert!(state.has_step("n2", "resume:n2"));
        assert!(!state.has_step("n2", "resume:other"));
        assert!(state.has_executed("n2"));
        assert!(!state.has_executed("n9"));
    }

    #[test]
    fn test_variables_merge() {
        let store = Store::open_in_memory().unwrap();
        store.init_workflow_state("c5", 1, None).unwrap();
        store
            .set_workflow_variable("c5", "varStatus", &serde_json::json!("ok"))
            .unwrap();
        store
            .set_workflow_variable("c5", "score", &serde_json::json!(10))
            .unwrap();
        let state = store.workflow_state("c5").unwrap().unwrap();
        assert_eq!(state.variables["varStatus"], serde_json::json!("ok"));
        assert_eq!(state.variables["score"], serde_json::json!(10));
    }
}
