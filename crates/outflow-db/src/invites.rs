//! Invite log (append-only), seat accounts, and the invite send queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outflow_core::error::Result;

use crate::state::parse_ts_opt;
use crate::{Store, store_err};

/// Seat/account tier on the external platform. Drives default limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Free,
    Premium,
    SalesNavigator,
    Recruiter,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Free => "free",
            AccountType::Premium => "premium",
            AccountType::SalesNavigator => "sales_navigator",
            AccountType::Recruiter => "recruiter",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "premium" => AccountType::Premium,
            "sales_navigator" => AccountType::SalesNavigator,
            "recruiter" => AccountType::Recruiter,
            _ => AccountType::Free,
        }
    }
}

/// A sending account with optional per-account limit overrides.
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub id: String,
    pub account_type: AccountType,
    pub daily_limit: Option<u32>,
    pub weekly_limit: Option<u32>,
    pub monthly_message_limit: Option<u32>,
    pub status: String,
}

/// One append-only invite log row.
#[derive(Debug, Clone)]
pub struct InviteLogEntry {
    pub id: String,
    pub account_id: String,
    pub campaign_id: Option<String>,
    pub lead_id: Option<String>,
    pub status: String,
    pub message_included: bool,
    pub sent_at: DateTime<Utc>,
}

/// Lifecycle of a queued invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteStatus {
    Pending,
    Scheduled,
    Sent,
    Accepted,
    Expired,
    Withdrawn,
    Failed,
}

impl InviteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InviteStatus::Pending => "pending",
            InviteStatus::Scheduled => "scheduled",
            InviteStatus::Sent => "sent",
            InviteStatus::Accepted => "accepted",
            InviteStatus::Expired => "expired",
            InviteStatus::Withdrawn => "withdrawn",
            InviteStatus::Failed => "failed",
        }
    }
}

/// A queued outbound connection request.
#[derive(Debug, Clone)]
pub struct InviteQueueEntry {
    pub id: String,
    pub account_id: String,
    pub campaign_id: Option<String>,
    pub agent_id: Option<i64>,
    pub lead_id: String,
    pub status: String,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub priority: i64,
}

impl Store {
    // ─── Accounts ──────────────────────────────────────

    pub fn upsert_account(&self, account: &AccountRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO accounts
             (id, account_type, daily_limit, weekly_limit, monthly_message_limit, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                account.id,
                account.account_type.as_str(),
                account.daily_limit,
                account.weekly_limit,
                account.monthly_message_limit,
                account.status
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn account(&self, account_id: &str) -> Result<Option<AccountRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, account_type, daily_limit, weekly_limit, monthly_message_limit, status
                 FROM accounts WHERE id = ?1",
            )
            .map_err(store_err)?;
        stmt.query_row([account_id], |row| {
            Ok(AccountRecord {
                id: row.get(0)?,
                account_type: AccountType::parse(&row.get::<_, String>(1)?),
                daily_limit: row.get(2)?,
                weekly_limit: row.get(3)?,
                monthly_message_limit: row.get(4)?,
                status: row.get(5)?,
            })
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(store_err(other)),
        })
    }

    // ─── Invite log ──────────────────────────────────────

    /// Append one row. Rows are immutable; corrections append new rows.
    pub fn log_invite(&self, entry: &InviteLogEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO invite_log
             (id, account_id, campaign_id, lead_id, status, message_included, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.id,
                entry.account_id,
                entry.campaign_id,
                entry.lead_id,
                entry.status,
                entry.message_included as i32,
                entry.sent_at.to_rfc3339()
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Count successfully-sent invites at or after `since`.
    pub fn invites_sent_since(&self, account_id: &str, since: DateTime<Utc>) -> Result<u32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM invite_log
             WHERE account_id = ?1 AND status = 'sent' AND sent_at >= ?2",
            rusqlite::params![account_id, since.to_rfc3339()],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u32)
        .map_err(store_err)
    }

    /// Count note-carrying sends at or after `since`.
    pub fn invites_with_message_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM invite_log
             WHERE account_id = ?1 AND status = 'sent' AND message_included = 1
               AND sent_at >= ?2",
            rusqlite::params![account_id, since.to_rfc3339()],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u32)
        .map_err(store_err)
    }

    // ─── Invite queue ──────────────────────────────────────

    pub fn enqueue_invite(&self, entry: &InviteQueueEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO invite_queue
             (id, account_id, campaign_id, agent_id, lead_id, status, scheduled_for,
              expires_at, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                entry.id,
                entry.account_id,
                entry.campaign_id,
                entry.agent_id,
                entry.lead_id,
                entry.status,
                entry.scheduled_for.map(|t| t.to_rfc3339()),
                entry.expires_at.map(|t| t.to_rfc3339()),
                entry.priority
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn invite_queue_entry(&self, id: &str) -> Result<Option<InviteQueueEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, account_id, campaign_id, agent_id, lead_id, status,
                        scheduled_for, sent_at, expires_at, priority
                 FROM invite_queue WHERE id = ?1",
            )
            .map_err(store_err)?;
        stmt.query_row([id], map_queue_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(store_err(other)),
            })
    }

    pub fn mark_invite_sent(
        &self,
        queue_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE invite_queue
             SET status = 'sent', sent_at = ?1, expires_at = ?2
             WHERE id = ?3",
            rusqlite::params![Utc::now().to_rfc3339(), expires_at.to_rfc3339(), queue_id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn mark_invite_accepted(&self, lead_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE invite_queue SET status = 'accepted'
                 WHERE lead_id = ?1 AND status = 'sent'",
                [lead_id],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    pub fn mark_invite_expired(&self, queue_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE invite_queue SET status = 'expired', expired_at = ?1 WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), queue_id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn mark_invite_withdrawn(&self, queue_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE invite_queue SET status = 'withdrawn', withdrawn_at = ?1 WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), queue_id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Sent invites whose TTL elapsed, oldest first.
    pub fn expired_invites(&self, now: DateTime<Utc>) -> Result<Vec<InviteQueueEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, account_id, campaign_id, agent_id, lead_id, status,
                        scheduled_for, sent_at, expires_at, priority
                 FROM invite_queue
                 WHERE status = 'sent' AND expires_at IS NOT NULL AND expires_at <= ?1
                 ORDER BY expires_at ASC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([now.to_rfc3339()], map_queue_row)
            .map_err(store_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)
    }

    /// Invites scheduled to go out at or before `now`, oldest first.
    pub fn due_scheduled_invites(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InviteQueueEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, account_id, campaign_id, agent_id, lead_id, status,
                        scheduled_for, sent_at, expires_at, priority
                 FROM invite_queue
                 WHERE status = 'scheduled' AND scheduled_for <= ?1
                 ORDER BY scheduled_for ASC, priority ASC
                 LIMIT ?2",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(
                rusqlite::params![now.to_rfc3339(), limit as i64],
                map_queue_row,
            )
            .map_err(store_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)
    }

    /// Invites occupying a pending slot for an account (sent or scheduled).
    pub fn pending_invites_count(&self, account_id: &str) -> Result<u32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM invite_queue
             WHERE account_id = ?1 AND status IN ('sent', 'scheduled')",
            [account_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u32)
        .map_err(store_err)
    }
}

fn map_queue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InviteQueueEntry> {
    Ok(InviteQueueEntry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        campaign_id: row.get(2)?,
        agent_id: row.get(3)?,
        lead_id: row.get(4)?,
        status: row.get(5)?,
        scheduled_for: parse_ts_opt(row.get::<_, Option<String>>(6)?),
        sent_at: parse_ts_opt(row.get::<_, Option<String>>(7)?),
        expires_at: parse_ts_opt(row.get::<_, Option<String>>(8)?),
        priority: row.get(9)?,
    })
}
