//! Agent definitions — the immutable workflow graph plus handoff settings.

use outflow_core::error::Result;

use crate::{Store, store_err};

/// An automation agent. The workflow definition is stored as JSON and
/// deserialized by the engine crate.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: i64,
    pub name: String,
    pub workflow_enabled: bool,
    pub workflow_definition: Option<serde_json::Value>,
    /// Transfer-trigger ids enabled for this agent (taxonomy keys).
    pub transfer_triggers: Vec<String>,
    /// Farewell sent on handoff; silent agents send nothing.
    pub transfer_message: Option<String>,
    pub transfer_silent: bool,
    pub notify_on_handoff: bool,
    pub sector_id: Option<String>,
}

impl Store {
    pub fn upsert_agent(&self, agent: &AgentRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO agents
             (id, name, workflow_enabled, workflow_definition, transfer_triggers,
              transfer_message, transfer_silent, notify_on_handoff, sector_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                agent.id,
                agent.name,
                agent.workflow_enabled as i32,
                agent
                    .workflow_definition
                    .as_ref()
                    .map(|v| v.to_string()),
                serde_json::to_string(&agent.transfer_triggers).map_err(store_err)?,
                agent.transfer_message,
                agent.transfer_silent as i32,
                agent.notify_on_handoff as i32,
                agent.sector_id
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn agent(&self, agent_id: i64) -> Result<Option<AgentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, workflow_enabled, workflow_definition, transfer_triggers,
                        transfer_message, transfer_silent, notify_on_handoff, sector_id
                 FROM agents WHERE id = ?1",
            )
            .map_err(store_err)?;
        stmt.query_row([agent_id], |row| {
            let definition: Option<String> = row.get(3)?;
            let triggers: String = row.get(4)?;
            Ok(AgentRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                workflow_enabled: row.get::<_, i32>(2)? != 0,
                workflow_definition: definition.and_then(|d| serde_json::from_str(&d).ok()),
                transfer_triggers: serde_json::from_str(&triggers).unwrap_or_default(),
                transfer_message: row.get(5)?,
                transfer_silent: row.get::<_, i32>(6)? != 0,
                notify_on_handoff: row.get::<_, i32>(7)? != 0,
                sector_id: row.get(8)?,
            })
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(store_err(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_agent(&AgentRecord {
                id: 7,
                name: "SDR Bot".into(),
                workflow_enabled: true,
                workflow_definition: Some(serde_json::json!({"nodes": [], "edges": []})),
                transfer_triggers: vec!["price".into(), "demo".into()],
                transfer_message: Some("Vou te passar para um especialista.".into()),
                transfer_silent: false,
                notify_on_handoff: true,
                sector_id: Some("sales".into()),
            })
            .unwrap();

        let agent = store.agent(7).unwrap().unwrap();
        assert!(agent.workflow_enabled);
        assert_eq!(agent.transfer_triggers, vec!["price", "demo"]);
        assert!(store.agent(99).unwrap().is_none());
    }
}
