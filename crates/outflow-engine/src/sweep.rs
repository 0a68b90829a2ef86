//! Invite expiration sweep.
//!
//! Runs as a recurring job: finds sent invites past their TTL, optionally
//! withdraws them through the messaging API, tags the lead, re-routes it
//! through the rotation service, and notifies the new owner.

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use rand::Rng;

use outflow_core::config::InviteConfig;
use outflow_core::error::Result;
use outflow_core::traits::Messenger;
use outflow_db::Store;

use crate::rotation::RotationService;

pub const EXPIRED_INVITE_TAG: &str = "Convite não aceito";

/// Counters for one sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub processed: u32,
    pub withdrawn: u32,
    pub reassigned: u32,
    pub errors: u32,
}

pub struct InviteSweeper {
    store: Arc<Store>,
    messenger: Arc<dyn Messenger>,
    rotation: RotationService,
    config: InviteConfig,
}

impl InviteSweeper {
    pub fn new(store: Arc<Store>, messenger: Arc<dyn Messenger>, config: InviteConfig) -> Self {
        let rotation = RotationService::new(store.clone());
        Self {
            store,
            messenger,
            rotation,
            config,
        }
    }

    /// Process every invite past its TTL. Failures on one invite don't stop
    /// the rest of the sweep.
    pub async fn process_expired_invites(&self) -> Result<SweepStats> {
        let expired = self.store.expired_invites(Utc::now())?;
        if expired.is_empty() {
            return Ok(SweepStats::default());
        }

        tracing::info!(count = expired.len(), "processing expired invites");
        let mut stats = SweepStats::default();

        for invite in expired {
            stats.processed += 1;
            match self.process_one(&invite).await {
                Ok(reassigned) => {
                    if self.config.withdraw_expired {
                        stats.withdrawn += 1;
                    }
                    if reassigned {
                        stats.reassigned += 1;
                    }
                }
                Err(e) => {
                    stats.errors += 1;
                    tracing::error!(queue_id = %invite.id, "expired invite failed: {e}");
                }
            }
        }

        tracing::info!(
            processed = stats.processed,
            withdrawn = stats.withdrawn,
            reassigned = stats.reassigned,
            errors = stats.errors,
            "expiration sweep done"
        );
        Ok(stats)
    }

    async fn process_one(&self, invite: &outflow_db::InviteQueueEntry) -> Result<bool> {
        // Withdraw through the external API when configured. A withdrawal
        // failure is logged but does not block the local bookkeeping — the
        // invite may simply no longer exist on the provider side.
        if self.config.withdraw_expired
            && let Some(lead) = self.store.lead(&invite.lead_id)?
            && let Some(profile_id) = &lead.profile_id
        {
            if let Err(e) = self
                .messenger
                .withdraw_invitation(&invite.account_id, profile_id)
                .await
            {
                tracing::warn!(lead = %invite.lead_id, "could not withdraw invite: {e}");
            }
            self.store.mark_invite_withdrawn(&invite.id)?;
        }

        self.store.mark_invite_expired(&invite.id)?;
        self.store
            .set_lead_status(&invite.lead_id, "invite_expired")?;
        self.store
            .add_tag(&invite.lead_id, EXPIRED_INVITE_TAG, "red")?;

        // Re-route the lead to a human through the agent's rotation.
        let mut reassigned = false;
        if let Some(agent_id) = invite.agent_id
            && let Some(assignee) =
                self.rotation
                    .assign_and_log(agent_id, &invite.account_id, None, Some(&invite.lead_id))?
        {
            reassigned = true;
            self.store.insert_notification(
                &invite.account_id,
                Some(assignee.user_id),
                "invite_expired",
                "Convite expirado",
                "Um convite expirou sem resposta e o lead foi direcionado para você.",
                None,
                &serde_json::json!({"lead_id": invite.lead_id}),
            )?;
        }

        Ok(reassigned)
    }
}

/// Randomized send instants inside the configured business-hours window,
/// sorted chronologically. Times landing in the past roll to the next day.
pub fn random_send_times(count: usize, config: &InviteConfig, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let mut rng = rand::thread_rng();
    let start = config.send_start_hour.min(23);
    let end = config.send_end_hour.clamp(start + 1, 24);
    let window_minutes = (end - start) * 60;

    let midnight = now
        .with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);

    let mut times: Vec<DateTime<Utc>> = (0..count)
        .map(|_| {
            let minute = rng.gen_range(0..window_minutes);
            let jitter = rng.gen_range(-5i64..=5);
            let mut at = midnight
                + Duration::minutes((start * 60 + minute) as i64)
                + Duration::minutes(jitter);
            if at < now {
                at += Duration::days(1);
            }
            at
        })
        .collect();
    times.sort();
    times
}
