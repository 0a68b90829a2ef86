//! Round-robin rotation — circular assignment of conversations to humans.
//!
//! The cursor persists in the store, so fairness survives process restarts.

use std::sync::Arc;

use outflow_core::error::Result;
use outflow_db::Store;

/// A selected assignee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignee {
    pub user_id: i64,
    pub user_name: String,
    /// 1-based position for display.
    pub rotation_position: i64,
    pub total_assignees: i64,
}

#[derive(Clone)]
pub struct RotationService {
    store: Arc<Store>,
}

impl RotationService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Deterministic circular rotation over the agent's active assignees.
    /// Returns `None` when no assignees are configured.
    pub fn get_next_assignee(&self, agent_id: i64) -> Result<Option<Assignee>> {
        let assignees = self.store.active_assignees(agent_id)?;
        if assignees.is_empty() {
            tracing::debug!(agent_id, "no active assignees configured");
            return Ok(None);
        }

        let len = assignees.len() as i64;
        let next_position = match self.store.rotation_state(agent_id)? {
            Some(state) => (state.current_position + 1).rem_euclid(len),
            None => 0,
        };

        let picked = &assignees[next_position as usize];
        self.store
            .advance_rotation(agent_id, next_position, picked.user_id)?;

        tracing::info!(
            agent_id,
            user = %picked.user_name,
            position = next_position + 1,
            total = len,
            "rotation selected assignee"
        );

        Ok(Some(Assignee {
            user_id: picked.user_id,
            user_name: picked.user_name.clone(),
            rotation_position: next_position + 1,
            total_assignees: len,
        }))
    }

    /// Select + reassign the conversation + audit-log, as one call, so the
    /// selected user and the recorded user cannot diverge. The audit insert
    /// is best-effort: a logging failure does not undo the assignment.
    pub fn assign_and_log(
        &self,
        agent_id: i64,
        account_id: &str,
        conversation_id: Option<&str>,
        lead_id: Option<&str>,
    ) -> Result<Option<Assignee>> {
        let Some(assignee) = self.get_next_assignee(agent_id)? else {
            return Ok(None);
        };

        if let Some(conversation_id) = conversation_id {
            self.store
                .assign_conversation(conversation_id, assignee.user_id)?;
        }

        if let Err(e) = self.store.log_assignment(
            Some(account_id),
            agent_id,
            lead_id,
            conversation_id,
            assignee.user_id,
            assignee.rotation_position,
            assignee.total_assignees,
        ) {
            tracing::error!(agent_id, "failed to log assignment: {e}");
        }

        Ok(Some(assignee))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outflow_db::people::UserRecord;

    fn service_with_users(user_ids: &[i64]) -> RotationService {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for id in user_ids {
            store
                .upsert_user(&UserRecord {
                    id: *id,
                    name: format!("user-{id}"),
                    email: None,
                    is_active: true,
                    sector_id: None,
                })
                .unwrap();
        }
        store.set_assignees(9, user_ids).unwrap();
        RotationService::new(store)
    }

    #[test]
    fn test_n_calls_visit_each_assignee_once() {
        let service = service_with_users(&[10, 20, 30]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(service.get_next_assignee(9).unwrap().unwrap().user_id);
        }
        seen.sort();
        assert_eq!(seen, vec![10, 20, 30]);

        // The (N+1)-th call wraps around to the first assignee.
        let fourth = service.get_next_assignee(9).unwrap().unwrap();
        assert_eq!(fourth.user_id, 10);
        assert_eq!(fourth.rotation_position, 1);
    }

    #[test]
    fn test_position_survives_service_restart() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for id in [1, 2] {
            store
                .upsert_user(&UserRecord {
                    id,
                    name: format!("user-{id}"),
                    email: None,
                    is_active: true,
                    sector_id: None,
                })
                .unwrap();
        }
        store.set_assignees(9, &[1, 2]).unwrap();

        let first = RotationService::new(store.clone());
        assert_eq!(first.get_next_assignee(9).unwrap().unwrap().user_id, 1);

        // A fresh service over the same store continues, not restarts.
        let second = RotationService::new(store);
        assert_eq!(second.get_next_assignee(9).unwrap().unwrap().user_id, 2);
    }

    #[test]
    fn test_no_assignees_returns_none() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let service = RotationService::new(store);
        assert!(service.get_next_assignee(42).unwrap().is_none());
    }

    #[test]
    fn test_assign_and_log_records_audit_row() {
        let service = service_with_users(&[1, 2]);
        let assignee = service
            .assign_and_log(9, "acc", None, Some("lead-1"))
            .unwrap()
            .unwrap();
        assert_eq!(assignee.user_id, 1);
        // Audit row written through the same call.
        let store = service.store.clone();
        assert_eq!(store.assignment_count(9).unwrap(), 1);
    }
}
