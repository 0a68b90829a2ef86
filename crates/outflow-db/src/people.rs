//! Users, agent assignees, and round-robin rotation state.

use chrono::Utc;

use outflow_core::error::Result;

use crate::{Store, store_err};

/// A human operator.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub is_active: bool,
    pub sector_id: Option<String>,
}

/// One assignee slot in an agent's rotation.
#[derive(Debug, Clone)]
pub struct AssigneeRecord {
    pub user_id: i64,
    pub user_name: String,
    pub rotation_order: i64,
    pub is_active: bool,
}

/// Persisted rotation cursor for an agent.
///
/// `current_position` is the index of the last pick; `-1` means no pick has
/// happened yet, so the next pick lands on position 0.
#[derive(Debug, Clone)]
pub struct RotationStateRecord {
    pub agent_id: i64,
    pub current_position: i64,
    pub last_assigned_user_id: Option<i64>,
    pub total_assignments: i64,
}

impl Store {
    // ─── Users ──────────────────────────────────────

    pub fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO users (id, name, email, is_active, sector_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                user.id,
                user.name,
                user.email,
                user.is_active as i32,
                user.sector_id
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn user(&self, id: i64) -> Result<Option<UserRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, name, email, is_active, sector_id FROM users WHERE id = ?1")
            .map_err(store_err)?;
        stmt.query_row([id], map_user_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(store_err(other)),
            })
    }

    /// Active users of a sector, ordered by name.
    pub fn active_sector_users(&self, sector_id: &str) -> Result<Vec<UserRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, email, is_active, sector_id FROM users
                 WHERE sector_id = ?1 AND is_active = 1 ORDER BY name",
            )
            .map_err(store_err)?;
        let rows = stmt.query_map([sector_id], map_user_row).map_err(store_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)
    }

    // ─── Assignees ──────────────────────────────────────

    /// Replace the assignee list and reset the rotation cursor so the next
    /// pick starts at the first assignee.
    pub fn set_assignees(&self, agent_id: i64, user_ids: &[i64]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err)?;
        tx.execute("DELETE FROM agent_assignees WHERE agent_id = ?1", [agent_id])
            .map_err(store_err)?;
        tx.execute(
            "DELETE FROM agent_rotation_state WHERE agent_id = ?1",
            [agent_id],
        )
        .map_err(store_err)?;
        for (i, user_id) in user_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO agent_assignees (agent_id, user_id, rotation_order, is_active)
                 VALUES (?1, ?2, ?3, 1)",
                rusqlite::params![agent_id, user_id, (i + 1) as i64],
            )
            .map_err(store_err)?;
        }
        if !user_ids.is_empty() {
            tx.execute(
                "INSERT INTO agent_rotation_state
                 (agent_id, current_position, total_assignments, updated_at)
                 VALUES (?1, -1, 0, ?2)",
                rusqlite::params![agent_id, Utc::now().to_rfc3339()],
            )
            .map_err(store_err)?;
        }
        tx.commit().map_err(store_err)?;
        Ok(())
    }

    /// Append an assignee at the end of the rotation.
    pub fn add_assignee(&self, agent_id: i64, user_id: i64) -> Result<()> {
        let conn = self.lock()?;
        let max_order: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(rotation_order), 0) FROM agent_assignees WHERE agent_id = ?1",
                [agent_id],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        conn.execute(
            "INSERT INTO agent_assignees (agent_id, user_id, rotation_order, is_active)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(agent_id, user_id) DO UPDATE SET is_active = 1",
            rusqlite::params![agent_id, user_id, max_order + 1],
        )
        .map_err(store_err)?;
        conn.execute(
            "INSERT OR IGNORE INTO agent_rotation_state
             (agent_id, current_position, total_assignments, updated_at)
             VALUES (?1, -1, 0, ?2)",
            rusqlite::params![agent_id, Utc::now().to_rfc3339()],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn remove_assignee(&self, agent_id: i64, user_id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM agent_assignees WHERE agent_id = ?1 AND user_id = ?2",
            rusqlite::params![agent_id, user_id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Active assignees in rotation order, joined with user names.
    pub fn active_assignees(&self, agent_id: i64) -> Result<Vec<AssigneeRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT aa.user_id, u.name, aa.rotation_order, aa.is_active
                 FROM agent_assignees aa
                 INNER JOIN users u ON u.id = aa.user_id
                 WHERE aa.agent_id = ?1 AND aa.is_active = 1 AND u.is_active = 1
                 ORDER BY aa.rotation_order ASC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([agent_id], |row| {
                Ok(AssigneeRecord {
                    user_id: row.get(0)?,
                    user_name: row.get(1)?,
                    rotation_order: row.get(2)?,
                    is_active: row.get::<_, i32>(3)? != 0,
                })
            })
            .map_err(store_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)
    }

    // ─── Rotation state ──────────────────────────────────────

    pub fn rotation_state(&self, agent_id: i64) -> Result<Option<RotationStateRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT agent_id, current_position, last_assigned_user_id, total_assignments
                 FROM agent_rotation_state WHERE agent_id = ?1",
            )
            .map_err(store_err)?;
        stmt.query_row([agent_id], |row| {
            Ok(RotationStateRecord {
                agent_id: row.get(0)?,
                current_position: row.get(1)?,
                last_assigned_user_id: row.get(2)?,
                total_assignments: row.get(3)?,
            })
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(store_err(other)),
        })
    }

    /// Persist one rotation step.
    pub fn advance_rotation(
        &self,
        agent_id: i64,
        new_position: i64,
        assigned_user_id: i64,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agent_rotation_state
             (agent_id, current_position, last_assigned_user_id, total_assignments, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(agent_id) DO UPDATE SET
               current_position = excluded.current_position,
               last_assigned_user_id = excluded.last_assigned_user_id,
               total_assignments = agent_rotation_state.total_assignments + 1,
               updated_at = excluded.updated_at",
            rusqlite::params![
                agent_id,
                new_position,
                assigned_user_id,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    // ─── Assignment audit log ──────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn log_assignment(
        &self,
        account_id: Option<&str>,
        agent_id: i64,
        lead_id: Option<&str>,
        conversation_id: Option<&str>,
        assigned_user_id: i64,
        rotation_position: i64,
        total_assignees: i64,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO assignment_log
             (account_id, agent_id, lead_id, conversation_id, assigned_user_id,
              rotation_position, total_assignees, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                account_id,
                agent_id,
                lead_id,
                conversation_id,
                assigned_user_id,
                rotation_position,
                total_assignees,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn assignment_count(&self, agent_id: i64) -> Result<u32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM assignment_log WHERE agent_id = ?1",
            [agent_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u32)
        .map_err(store_err)
    }
}

fn map_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        is_active: row.get::<_, i32>(3)? != 0,
        sector_id: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_users(store: &Store, ids: &[i64]) {
        for id in ids {
            store
                .upsert_user(&UserRecord {
                    id: *id,
                    name: format!("user-{id}"),
                    email: None,
                    is_active: true,
                    sector_id: Some("sales".into()),
                })
                .unwrap();
        }
    }

    #[test]
    fn test_set_assignees_resets_cursor() {
        let store = Store::open_in_memory().unwrap();
        seed_users(&store, &[1, 2, 3]);
        store.set_assignees(9, &[1, 2, 3]).unwrap();

        let state = store.rotation_state(9).unwrap().unwrap();
        assert_eq!(state.current_position, -1);
        assert_eq!(state.total_assignments, 0);

        let assignees = store.active_assignees(9).unwrap();
        assert_eq!(assignees.len(), 3);
        assert_eq!(assignees[0].user_id, 1);
        assert_eq!(assignees[2].rotation_order, 3);
    }

    #[test]
    fn test_advance_rotation_counts() {
        let store = Store::open_in_memory().unwrap();
        seed_users(&store, &[1, 2]);
        store.set_assignees(9, &[1, 2]).unwrap();

        store.advance_rotation(9, 0, 1).unwrap();
        store.advance_rotation(9, 1, 2).unwrap();
        let state = store.rotation_state(9).unwrap().unwrap();
        assert_eq!(state.current_position, 1);
        assert_eq!(state.last_assigned_user_id, Some(2));
        assert_eq!(state.total_assignments, 2);
    }

    #[test]
    fn test_inactive_users_excluded() {
        let store = Store::open_in_memory().unwrap();
        seed_users(&store, &[1, 2]);
        store
            .upsert_user(&UserRecord {
                id: 3,
                name: "inactive".into(),
                email: None,
                is_active: false,
                sector_id: Some("sales".into()),
            })
            .unwrap();
        store.set_assignees(9, &[1, 2, 3]).unwrap();
        assert_eq!(store.active_assignees(9).unwrap().len(), 2);
        assert_eq!(store.active_sector_users("sales").unwrap().len(), 2);
    }
}
