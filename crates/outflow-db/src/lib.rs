//! # Outflow DB
//!
//! SQLite-backed persistence — survives restarts, supports concurrent
//! workers through short transactions. Timestamps are stored as RFC 3339
//! text; JSON columns hold workflow variables and step history.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use outflow_core::error::{OutflowError, Result};

pub mod agents;
pub mod crm;
pub mod invites;
pub mod people;
pub mod state;

pub use agents::AgentRecord;
pub use crm::{ConversationRecord, MessageRecord, OpportunityMove};
pub use invites::{AccountRecord, AccountType, InviteLogEntry, InviteQueueEntry, InviteStatus};
pub use people::{AssigneeRecord, RotationStateRecord, UserRecord};
pub use state::{StepRecord, WorkflowStateRecord, WorkflowStatus};

/// The Outflow store. Cheap to share behind an `Arc`.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

pub(crate) fn store_err<E: std::fmt::Display>(e: E) -> OutflowError {
    OutflowError::Store(e.to_string())
}

impl Store {
    /// Open or create the store at the given path.
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

    /// Open an in-memory store (tests).
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
            -- One row per conversation; never deleted.
            CREATE TABLE IF NOT EXISTS workflow_state (
                conversation_id TEXT PRIMARY KEY,
                agent_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                current_node_id TEXT,
                resume_node_id TEXT,
                paused_reason TEXT,
                paused_until TEXT,
                resume_job_id TEXT,
                variables TEXT NOT NULL DEFAULT '{}',
                step_history TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Append-only; rolling-window limits derive from it.
            CREATE TABLE IF NOT EXISTS invite_log (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                campaign_id TEXT,
                lead_id TEXT,
                status TEXT NOT NULL DEFAULT 'sent',
                message_included INTEGER NOT NULL DEFAULT 0,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_invite_log_account_sent
                ON invite_log(account_id, sent_at);

            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                account_type TEXT NOT NULL DEFAULT 'free',
                daily_limit INTEGER,
                weekly_limit INTEGER,
                monthly_message_limit INTEGER,
                status TEXT NOT NULL DEFAULT 'active'
            );

            CREATE TABLE IF NOT EXISTS invite_queue (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                campaign_id TEXT,
                agent_id INTEGER,
                lead_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                scheduled_for TEXT,
                sent_at TEXT,
                expires_at TEXT,
                expired_at TEXT,
                withdrawn_at TEXT,
                priority INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_invite_queue_status
                ON invite_queue(status, scheduled_for);

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                agent_id INTEGER,
                campaign_id TEXT,
                lead_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                ai_active INTEGER NOT NULL DEFAULT 1,
                assigned_user_id INTEGER,
                handoff_at TEXT,
                handoff_reason TEXT,
                exchange_count INTEGER NOT NULL DEFAULT 0,
                closed_at TEXT,
                close_reason TEXT,
                last_message_at TEXT,
                last_message_preview TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'sent',
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, sent_at);

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                account_id TEXT,
                name TEXT,
                first_name TEXT,
                email TEXT,
                phone TEXT,
                company TEXT,
                title TEXT,
                location TEXT,
                industry TEXT,
                status TEXT,
                profile_id TEXT,
                sector_id TEXT
            );

            CREATE TABLE IF NOT EXISTS entity_tags (
                entity_id TEXT NOT NULL,
                tag_name TEXT NOT NULL,
                tag_color TEXT NOT NULL DEFAULT 'gray',
                created_at TEXT NOT NULL,
                PRIMARY KEY (entity_id, tag_name)
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                user_id INTEGER,
                kind TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                conversation_id TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            -- One pipeline record per lead+pipeline pair.
            CREATE TABLE IF NOT EXISTS opportunities (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL,
                pipeline_id TEXT NOT NULL,
                stage_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (lead_id, pipeline_id)
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                sector_id TEXT
            );

            CREATE TABLE IF NOT EXISTS agent_assignees (
                agent_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                rotation_order INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (agent_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS agent_rotation_state (
                agent_id INTEGER PRIMARY KEY,
                current_position INTEGER NOT NULL DEFAULT -1,
                last_assigned_user_id INTEGER,
                total_assignments INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agents (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                workflow_enabled INTEGER NOT NULL DEFAULT 0,
                workflow_definition TEXT,
                transfer_triggers TEXT NOT NULL DEFAULT '[]',
                transfer_message TEXT,
                transfer_silent INTEGER NOT NULL DEFAULT 0,
                notify_on_handoff INTEGER NOT NULL DEFAULT 1,
                sector_id TEXT
            );

            CREATE TABLE IF NOT EXISTS assignment_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT,
                agent_id INTEGER NOT NULL,
                lead_id TEXT,
                conversation_id TEXT,
                assigned_user_id INTEGER NOT NULL,
                rotation_position INTEGER NOT NULL,
                total_assignees INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            ",
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(store_err)
    }
}
