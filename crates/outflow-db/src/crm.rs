//! Conversations, messages, leads, tags, notifications, opportunities.

use chrono::{DateTime, Utc};

use outflow_core::error::{OutflowError, Result};
use outflow_core::types::{ConversationStats, LeadProfile};

use crate::state::parse_ts_opt;
use crate::{Store, store_err};

/// A conversation between one account seat and one lead.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub id: String,
    pub account_id: String,
    pub agent_id: Option<i64>,
    pub campaign_id: Option<String>,
    pub lead_id: String,
    pub status: String,
    pub ai_active: bool,
    pub assigned_user_id: Option<i64>,
    pub handoff_reason: Option<String>,
    pub exchange_count: u32,
    pub close_reason: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// A persisted message. `status` is `sent` or `send_failed` — failed sends
/// are kept so operators can see what the automation attempted.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender: String,
    pub content: String,
    pub status: String,
    pub sent_at: DateTime<Utc>,
}

/// Outcome of a stage move.
#[derive(Debug, Clone)]
pub struct OpportunityMove {
    pub moved: bool,
    pub opportunity_id: Option<String>,
    pub reason: Option<String>,
}

impl Store {
    // ─── Conversations ──────────────────────────────────────

    pub fn upsert_conversation(&self, conv: &ConversationRecord) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO conversations
             (id, account_id, agent_id, campaign_id, lead_id, status, ai_active,
              assigned_user_id, exchange_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(id) DO UPDATE SET
               status = excluded.status,
               ai_active = excluded.ai_active,
               assigned_user_id = excluded.assigned_user_id,
               updated_at = excluded.updated_at",
            rusqlite::params![
                conv.id,
                conv.account_id,
                conv.agent_id,
                conv.campaign_id,
                conv.lead_id,
                conv.status,
                conv.ai_active as i32,
                conv.assigned_user_id,
                conv.exchange_count,
                now
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn conversation(&self, id: &str) -> Result<Option<ConversationRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, account_id, agent_id, campaign_id, lead_id, status, ai_active,
                        assigned_user_id, handoff_reason, exchange_count, close_reason,
                        last_message_at
                 FROM conversations WHERE id = ?1",
            )
            .map_err(store_err)?;
        stmt.query_row([id], |row| {
            Ok(ConversationRecord {
                id: row.get(0)?,
                account_id: row.get(1)?,
                agent_id: row.get(2)?,
                campaign_id: row.get(3)?,
                lead_id: row.get(4)?,
                status: row.get(5)?,
                ai_active: row.get::<_, i32>(6)? != 0,
                assigned_user_id: row.get(7)?,
                handoff_reason: row.get(8)?,
                exchange_count: row.get::<_, i64>(9)? as u32,
                close_reason: row.get(10)?,
                last_message_at: parse_ts_opt(row.get::<_, Option<String>>(11)?),
            })
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(store_err(other)),
        })
    }

    /// Hand the conversation to a human: automation off, status manual.
    pub fn disable_automation(
        &self,
        conversation_id: &str,
        reason: &str,
        assigned_user_id: Option<i64>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE conversations
             SET ai_active = 0, status = 'manual', handoff_at = ?1, handoff_reason = ?2,
                 assigned_user_id = COALESCE(?3, assigned_user_id), updated_at = ?1
             WHERE id = ?4",
            rusqlite::params![
                Utc::now().to_rfc3339(),
                reason,
                assigned_user_id,
                conversation_id
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn assign_conversation(&self, conversation_id: &str, user_id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE conversations SET assigned_user_id = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![user_id, Utc::now().to_rfc3339(), conversation_id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Terminal status update on lead + conversation in one transaction.
    pub fn close_conversation(
        &self,
        conversation_id: &str,
        positive: bool,
    ) -> Result<()> {
        let (close_reason, lead_status) = if positive {
            ("positive", "qualified")
        } else {
            ("negative", "not_interested")
        };
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err)?;
        let lead_id: Option<String> = tx
            .query_row(
                "SELECT lead_id FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(store_err(other)),
            })?;
        let Some(lead_id) = lead_id else {
            return Err(OutflowError::StateInconsistency(format!(
                "conversation {conversation_id} not found"
            )));
        };
        tx.execute(
            "UPDATE conversations
             SET status = 'closed', ai_active = 0, closed_at = ?1, close_reason = ?2,
                 updated_at = ?1
             WHERE id = ?3",
            rusqlite::params![now, close_reason, conversation_id],
        )
        .map_err(store_err)?;
        tx.execute(
            "UPDATE leads SET status = ?1 WHERE id = ?2",
            rusqlite::params![lead_status, lead_id],
        )
        .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(())
    }

    pub fn increment_exchange_count(&self, conversation_id: &str) -> Result<u32> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE conversations
             SET exchange_count = exchange_count + 1, updated_at = ?1
             WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), conversation_id],
        )
        .map_err(store_err)?;
        conn.query_row(
            "SELECT exchange_count FROM conversations WHERE id = ?1",
            [conversation_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u32)
        .map_err(store_err)
    }

    pub fn update_last_message(&self, conversation_id: &str, preview: &str) -> Result<()> {
        let truncated: String = preview.chars().take(100).collect();
        let conn = self.lock()?;
        conn.execute(
            "UPDATE conversations
             SET last_message_at = ?1, last_message_preview = ?2, updated_at = ?1
             WHERE id = ?3",
            rusqlite::params![Utc::now().to_rfc3339(), truncated, conversation_id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    // ─── Messages ──────────────────────────────────────

    /// Persist a message (including failed sends) and return its id.
    pub fn insert_message(
        &self,
        conversation_id: &str,
        sender: &str,
        content: &str,
        status: &str,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (id, conversation_id, sender, content, status, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                id,
                conversation_id,
                sender,
                content,
                status,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(store_err)?;
        Ok(id)
    }

    /// Messages of a conversation in send order, failed sends included.
    pub fn messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, sender, content, status, sent_at
                 FROM messages WHERE conversation_id = ?1 ORDER BY sent_at ASC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([conversation_id], |row| {
                Ok(MessageRecord {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    sender: row.get(2)?,
                    content: row.get(3)?,
                    status: row.get(4)?,
                    sent_at: crate::state::parse_ts(&row.get::<_, String>(5)?),
                })
            })
            .map_err(store_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)
    }

    pub fn conversation_stats(&self, conversation_id: &str) -> Result<ConversationStats> {
        let conn = self.lock()?;
        let (lead_messages, ai_messages, total, last): (i64, i64, i64, Option<String>) = conn
            .query_row(
                "SELECT
                   COUNT(*) FILTER (WHERE sender = 'lead'),
                   COUNT(*) FILTER (WHERE sender = 'ai'),
                   COUNT(*),
                   MAX(sent_at)
                 FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(store_err)?;
        Ok(ConversationStats {
            lead_messages: lead_messages as u32,
            ai_messages: ai_messages as u32,
            total_messages: total as u32,
            exchange_count: lead_messages.min(ai_messages) as u32,
            last_message_at: parse_ts_opt(last),
        })
    }

    // ─── Leads ──────────────────────────────────────

    pub fn upsert_lead(&self, account_id: &str, lead: &LeadProfile) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO leads
             (id, account_id, name, first_name, email, phone, company, title, location,
              industry, status, profile_id, sector_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                lead.id,
                account_id,
                lead.name,
                lead.first_name,
                lead.email,
                lead.phone,
                lead.company,
                lead.title,
                lead.location,
                lead.industry,
                lead.status,
                lead.profile_id,
                lead.sector_id
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn lead(&self, lead_id: &str) -> Result<Option<LeadProfile>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, first_name, email, phone, company, title, location,
                        industry, status, profile_id, sector_id
                 FROM leads WHERE id = ?1",
            )
            .map_err(store_err)?;
        stmt.query_row([lead_id], |row| {
            Ok(LeadProfile {
                id: row.get(0)?,
                name: row.get(1)?,
                first_name: row.get(2)?,
                email: row.get(3)?,
                phone: row.get(4)?,
                company: row.get(5)?,
                title: row.get(6)?,
                location: row.get(7)?,
                industry: row.get(8)?,
                status: row.get(9)?,
                profile_id: row.get(10)?,
                sector_id: row.get(11)?,
            })
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(store_err(other)),
        })
    }

    pub fn set_lead_status(&self, lead_id: &str, status: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE leads SET status = ?1 WHERE id = ?2",
            rusqlite::params![status, lead_id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    // ─── Tags ──────────────────────────────────────

    /// Idempotent set-membership add.
    pub fn add_tag(&self, entity_id: &str, name: &str, color: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO entity_tags (entity_id, tag_name, tag_color, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(entity_id, tag_name) DO UPDATE SET tag_color = excluded.tag_color",
            rusqlite::params![entity_id, name, color, Utc::now().to_rfc3339()],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn remove_tag(&self, entity_id: &str, name: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM entity_tags WHERE entity_id = ?1 AND tag_name = ?2",
            rusqlite::params![entity_id, name],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn remove_all_tags(&self, entity_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM entity_tags WHERE entity_id = ?1", [entity_id])
            .map_err(store_err)?;
        Ok(())
    }

    pub fn tags(&self, entity_id: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT tag_name FROM entity_tags WHERE entity_id = ?1 ORDER BY tag_name")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([entity_id], |row| row.get::<_, String>(0))
            .map_err(store_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)
    }

    // ─── Notifications ──────────────────────────────────────

    pub fn insert_notification(
        &self,
        account_id: &str,
        user_id: Option<i64>,
        kind: &str,
        title: &str,
        body: &str,
        conversation_id: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO notifications
             (account_id, user_id, kind, title, body, conversation_id, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                account_id,
                user_id,
                kind,
                title,
                body,
                conversation_id,
                metadata.to_string(),
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(store_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn notification_count(&self, account_id: &str) -> Result<u32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE account_id = ?1",
            [account_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u32)
        .map_err(store_err)
    }

    // ─── Opportunities ──────────────────────────────────────

    /// Find or create the pipeline record for a lead+pipeline pair.
    /// Returns `(opportunity_id, created)`.
    pub fn find_or_create_opportunity(
        &self,
        lead_id: &str,
        pipeline_id: &str,
        stage_id: &str,
    ) -> Result<(String, bool)> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM opportunities WHERE lead_id = ?1 AND pipeline_id = ?2",
                rusqlite::params![lead_id, pipeline_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(store_err(other)),
            })?;
        if let Some(id) = existing {
            return Ok((id, false));
        }
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO opportunities (id, lead_id, pipeline_id, stage_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            rusqlite::params![id, lead_id, pipeline_id, stage_id, now],
        )
        .map_err(store_err)?;
        Ok((id, true))
    }

    /// Move a lead's opportunity to a new stage. No opportunity or already
    /// in the stage is reported, not an error.
    pub fn move_opportunity_stage(
        &self,
        lead_id: &str,
        stage_id: &str,
    ) -> Result<OpportunityMove> {
        let conn = self.lock()?;
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT id, stage_id FROM opportunities WHERE lead_id = ?1
                 ORDER BY updated_at DESC LIMIT 1",
                [lead_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(store_err(other)),
            })?;
        let Some((id, current_stage)) = existing else {
            return Ok(OpportunityMove {
                moved: false,
                opportunity_id: None,
                reason: Some("no_opportunity_found".into()),
            });
        };
        if current_stage == stage_id {
            return Ok(OpportunityMove {
                moved: false,
                opportunity_id: Some(id),
                reason: Some("already_in_stage".into()),
            });
        }
        conn.execute(
            "UPDATE opportunities SET stage_id = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![stage_id, Utc::now().to_rfc3339(), id],
        )
        .map_err(store_err)?;
        Ok(OpportunityMove {
            moved: true,
            opportunity_id: Some(id),
            reason: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(store: &Store) {
        store
            .upsert_lead(
                "acc",
                &LeadProfile {
                    id: "lead-1".into(),
                    name: Some("João Lima".into()),
                    status: Some("accepted".into()),
                    ..LeadProfile::default()
                },
            )
            .unwrap();
        store
            .upsert_conversation(&ConversationRecord {
                id: "conv-1".into(),
                account_id: "acc".into(),
                agent_id: Some(1),
                campaign_id: None,
                lead_id: "lead-1".into(),
                status: "open".into(),
                ai_active: true,
                assigned_user_id: None,
                handoff_reason: None,
                exchange_count: 0,
                close_reason: None,
                last_message_at: None,
            })
            .unwrap();
    }

    #[test]
    fn test_close_positive_updates_lead_and_conversation() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        store.close_conversation("conv-1", true).unwrap();

        let conv = store.conversation("conv-1").unwrap().unwrap();
        assert_eq!(conv.status, "closed");
        assert!(!conv.ai_active);
        assert_eq!(conv.close_reason.as_deref(), Some("positive"));

        let lead = store.lead("lead-1").unwrap().unwrap();
        assert_eq!(lead.status.as_deref(), Some("qualified"));
    }

    #[test]
    fn test_tags_are_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.add_tag("lead-1", "Convite não aceito", "red").unwrap();
        store.add_tag("lead-1", "Convite não aceito", "red").unwrap();
        assert_eq!(store.tags("lead-1").unwrap().len(), 1);

        store.remove_tag("lead-1", "Convite não aceito").unwrap();
        assert!(store.tags("lead-1").unwrap().is_empty());
    }

    #[test]
    fn test_opportunity_idempotent_per_pipeline() {
        let store = Store::open_in_memory().unwrap();
        let (id1, created1) = store
            .find_or_create_opportunity("lead-1", "pipe-1", "stage-1")
            .unwrap();
        let (id2, created2) = store
            .find_or_create_opportunity("lead-1", "pipe-1", "stage-2")
            .unwrap();
        assert!(created1);
        assert!(!created2);
        assert_eq!(id1, id2);

        let mv = store.move_opportunity_stage("lead-1", "stage-2").unwrap();
        assert!(mv.moved);
        let again = store.move_opportunity_stage("lead-1", "stage-2").unwrap();
        assert!(!again.moved);
        assert_eq!(again.reason.as_deref(), Some("already_in_stage"));
    }

    #[test]
    fn test_failed_send_is_persisted() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        store
            .insert_message("conv-1", "ai", "Olá!", "send_failed")
            .unwrap();
        let stats = store.conversation_stats("conv-1").unwrap();
        assert_eq!(stats.ai_messages, 1);

        let messages = store.messages("conv-1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, "send_failed");
        assert_eq!(messages[0].content, "Olá!");
    }

    #[test]
    fn test_exchange_count() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        assert_eq!(store.increment_exchange_count("conv-1").unwrap(), 1);
        assert_eq!(store.increment_exchange_count("conv-1").unwrap(), 2);
    }
}
