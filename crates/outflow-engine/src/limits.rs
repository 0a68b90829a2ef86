//! Invite rate limiter — three independent windows over the append-only
//! invite log.
//!
//! daily: 24h rolling, inner safety cap to avoid bursts.
//! weekly: 7-day rolling, the platform's hard ceiling.
//! monthly_messages: calendar month (UTC), personalized-note sends only —
//! the platform restricts noted invites more tightly than plain ones.

use std::sync::Arc;

use chrono::{Datelike, Duration, TimeZone, Utc};

use outflow_core::error::{OutflowError, Result};
use outflow_db::{AccountType, InviteLogEntry, Store};

/// Per-tier default caps. `monthly_messages = None` means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    pub daily: u32,
    pub weekly: u32,
    pub monthly_messages: Option<u32>,
    pub note_char_limit: usize,
}

/// Defaults aligned with the platform's observed enforcement.
pub fn tier_limits(account_type: AccountType) -> TierLimits {
    match account_type {
        AccountType::Free => TierLimits {
            daily: 20,
            weekly: 100,
            monthly_messages: Some(10),
            note_char_limit: 200,
        },
        AccountType::Premium => TierLimits {
            daily: 35,
            weekly: 200,
            monthly_messages: None,
            note_char_limit: 300,
        },
        AccountType::SalesNavigator | AccountType::Recruiter => TierLimits {
            daily: 40,
            weekly: 250,
            monthly_messages: None,
            note_char_limit: 300,
        },
    }
}

/// Usage of one window: sends counted against its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct WindowUsage {
    pub sent: u32,
    pub limit: u32,
    pub remaining: u32,
}

impl WindowUsage {
    fn new(sent: u32, limit: u32) -> Self {
        Self {
            sent,
            limit,
            remaining: limit.saturating_sub(sent),
        }
    }

    fn exhausted(&self) -> bool {
        self.sent >= self.limit
    }
}

/// The allowance decision for one account.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InviteAllowance {
    pub can_send: bool,
    pub can_send_with_message: bool,
    pub daily: WindowUsage,
    pub weekly: WindowUsage,
    /// Absent when the tier has unlimited noted invites.
    pub monthly_messages: Option<WindowUsage>,
    /// First binding constraint, priority weekly > daily > monthly_messages.
    pub limit_reason: Option<&'static str>,
}

pub struct InviteLimiter {
    store: Arc<Store>,
}

impl InviteLimiter {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Decide whether the account may send another invite right now.
    ///
    /// Not atomic with [`InviteLimiter::log_invite_sent`]: two concurrent
    /// senders can both pass the check at the cap boundary. Accepted —
    /// per-account send cadence is human-scale.
    pub fn can_send_invite(&self, account_id: &str) -> Result<InviteAllowance> {
        let account = self.store.account(account_id)?.ok_or_else(|| {
            OutflowError::Permanent(format!("account {account_id} not found"))
        })?;

        let defaults = tier_limits(account.account_type);
        let daily_limit = account.daily_limit.unwrap_or(defaults.daily);
        let weekly_limit = account.weekly_limit.unwrap_or(defaults.weekly);
        let monthly_cap = account
            .monthly_message_limit
            .map(Some)
            .unwrap_or(defaults.monthly_messages);

        let now = Utc::now();
        let sent_today = self
            .store
            .invites_sent_since(account_id, now - Duration::hours(24))?;
        let sent_week = self
            .store
            .invites_sent_since(account_id, now - Duration::days(7))?;

        let daily = WindowUsage::new(sent_today, daily_limit);
        let weekly = WindowUsage::new(sent_week, weekly_limit);

        let monthly_messages = match monthly_cap {
            Some(cap) => {
                let month_start = Utc
                    .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                    .single()
                    .unwrap_or(now);
                let sent_month = self
                    .store
                    .invites_with_message_since(account_id, month_start)?;
                Some(WindowUsage::new(sent_month, cap))
            }
            None => None,
        };

        let can_send = !daily.exhausted() && !weekly.exhausted();
        let monthly_exhausted = monthly_messages.map(|m| m.exhausted()).unwrap_or(false);
        let can_send_with_message = can_send && !monthly_exhausted;

        let limit_reason = if weekly.exhausted() {
            Some("weekly")
        } else if daily.exhausted() {
            Some("daily")
        } else if monthly_exhausted {
            Some("monthly_messages")
        } else {
            None
        };

        Ok(InviteAllowance {
            can_send,
            can_send_with_message,
            daily,
            weekly,
            monthly_messages,
            limit_reason,
        })
    }

    /// Append one send to the log. Never mutates prior rows.
    pub fn log_invite_sent(
        &self,
        account_id: &str,
        campaign_id: Option<&str>,
        lead_id: Option<&str>,
        status: &str,
        message_included: bool,
    ) -> Result<()> {
        self.store.log_invite(&InviteLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            campaign_id: campaign_id.map(String::from),
            lead_id: lead_id.map(String::from),
            status: status.to_string(),
            message_included,
            sent_at: Utc::now(),
        })
    }

    /// Current usage snapshot for dashboards and the console.
    pub fn get_invite_stats(&self, account_id: &str) -> Result<InviteAllowance> {
        self.can_send_invite(account_id)
    }

    /// Maximum characters for a personalized note on this account's tier.
    pub fn note_char_limit(&self, account_id: &str) -> Result<usize> {
        let account = self.store.account(account_id)?.ok_or_else(|| {
            OutflowError::Permanent(format!("account {account_id} not found"))
        })?;
        Ok(tier_limits(account.account_type).note_char_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outflow_db::AccountRecord;

    fn seed_account(store: &Store, daily: Option<u32>, weekly: Option<u32>) {
        store
            .upsert_account(&AccountRecord {
                id: "acc".into(),
                account_type: AccountType::Free,
                daily_limit: daily,
                weekly_limit: weekly,
                monthly_message_limit: None,
                status: "active".into(),
            })
            .unwrap();
    }

    fn log_at(store: &Store, hours_ago: i64, with_message: bool) {
        store
            .log_invite(&InviteLogEntry {
                id: uuid::Uuid::new_v4().to_string(),
                account_id: "acc".into(),
                campaign_id: None,
                lead_id: None,
                status: "sent".into(),
                message_included: with_message,
                sent_at: Utc::now() - Duration::hours(hours_ago),
            })
            .unwrap();
    }

    #[test]
    fn test_daily_limit_binds_before_weekly() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_account(&store, Some(20), Some(100));
        // 20 today, 30 more earlier in the week: 50 total this week.
        for _ in 0..20 {
            log_at(&store, 1, false);
        }
        for _ in 0..30 {
            log_at(&store, 48, false);
        }

        let limiter = InviteLimiter::new(store);
        let allowance = limiter.can_send_invite("acc").unwrap();
        assert!(!allowance.can_send);
        assert_eq!(allowance.limit_reason, Some("daily"));
        assert_eq!(allowance.daily.sent, 20);
        assert_eq!(allowance.weekly.sent, 50);
    }

    #[test]
    fn test_recovers_after_window_ages_out() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_account(&store, Some(20), Some(100));
        // All 20 sends are >24h old: the daily window is clear again.
        for _ in 0..20 {
            log_at(&store, 25, false);
        }

        let limiter = InviteLimiter::new(store);
        let allowance = limiter.can_send_invite("acc").unwrap();
        assert!(allowance.can_send);
        assert_eq!(allowance.daily.sent, 0);
        assert_eq!(allowance.weekly.sent, 20);
        assert!(allowance.limit_reason.is_none());
    }

    #[test]
    fn test_weekly_reason_takes_priority() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_account(&store, Some(5), Some(10));
        for _ in 0..10 {
            log_at(&store, 1, false);
        }

        let limiter = InviteLimiter::new(store);
        let allowance = limiter.can_send_invite("acc").unwrap();
        assert!(!allowance.can_send);
        // Both daily and weekly are exhausted; weekly is reported first.
        assert_eq!(allowance.limit_reason, Some("weekly"));
    }

    #[test]
    fn test_monthly_messages_gate_noted_invites_only() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .upsert_account(&AccountRecord {
                id: "acc".into(),
                account_type: AccountType::Free,
                daily_limit: Some(50),
                weekly_limit: Some(200),
                monthly_message_limit: Some(2),
                status: "active".into(),
            })
            .unwrap();
        log_at(&store, 1, true);
        log_at(&store, 2, true);
        log_at(&store, 3, false);

        let limiter = InviteLimiter::new(store);
        let allowance = limiter.can_send_invite("acc").unwrap();
        assert!(allowance.can_send);
        assert!(!allowance.can_send_with_message);
        assert_eq!(allowance.limit_reason, Some("monthly_messages"));
        assert_eq!(allowance.monthly_messages.unwrap().sent, 2);
    }

    #[test]
    fn test_counts_never_increase_as_sends_age() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_account(&store, None, None);
        log_at(&store, 1, false);
        let limiter = InviteLimiter::new(store);

        let first = limiter.can_send_invite("acc").unwrap();
        let second = limiter.can_send_invite("acc").unwrap();
        // With no writes in between, usage is non-increasing.
        assert!(second.daily.sent <= first.daily.sent);
        assert!(second.weekly.sent <= first.weekly.sent);
    }

    #[test]
    fn test_tier_defaults_apply_without_overrides() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_account(&store, None, None);
        let limiter = InviteLimiter::new(store);
        let allowance = limiter.can_send_invite("acc").unwrap();
        assert_eq!(allowance.daily.limit, 20);
        assert_eq!(allowance.weekly.limit, 100);
        assert_eq!(allowance.monthly_messages.unwrap().limit, 10);
    }

    #[test]
    fn test_unknown_account_is_permanent_error() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let limiter = InviteLimiter::new(store);
        let err = limiter.can_send_invite("ghost").unwrap_err();
        assert!(!err.is_retryable());
    }
}
