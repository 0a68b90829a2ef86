//! Outflow worker — wires the store, the scheduler, and the engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use outflow_connect::{HttpGenerator, HttpMessenger, Mailer, NoopMessenger, StaticGenerator};
use outflow_core::error::OutflowError;
use outflow_core::traits::{Messenger, TextGenerator};
use outflow_core::types::{EventPayload, EventType};
use outflow_core::OutflowConfig;
use outflow_db::Store;
use outflow_engine::{InviteLimiter, InviteSweeper, WorkflowEngine};
use outflow_scheduler::{
    Job, JobHandler, JobKind, JobStore, RetryPolicy, SchedulerEngine, spawn_scheduler,
};

#[derive(Parser)]
#[command(name = "outflow", version, about = "Workflow automation engine for outbound campaigns")]
struct Cli {
    /// Path to config.toml (defaults to ~/.outflow/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker: scheduler loop + event processing (default).
    Serve,
    /// Print queue statistics and parked jobs.
    Status,
    /// Feed one event through a conversation's workflow.
    Event {
        conversation_id: String,
        /// invite_accepted | invite_ignored | message_received | no_response
        event: String,
        #[arg(long)]
        message: Option<String>,
    },
    /// Dry-run an event in test mode: every action simulates, nothing is
    /// sent and no timers are scheduled.
    DryRun {
        conversation_id: String,
        event: String,
        #[arg(long)]
        message: Option<String>,
    },
}

/// Everything a job needs to run.
struct Services {
    store: Arc<Store>,
    jobs: Arc<JobStore>,
    engine: WorkflowEngine,
    limiter: InviteLimiter,
    sweeper: InviteSweeper,
    mailer: Mailer,
    messenger: Arc<dyn Messenger>,
    config: OutflowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outflow=info,warn".into()),
        )
        .init();

    let config = match &cli.config {
        Some(path) => OutflowConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => OutflowConfig::load().context("loading config")?,
    };

    let services = Arc::new(build_services(config)?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(services).await,
        Command::Status => status(&services),
        Command::Event {
            conversation_id,
            event,
            message,
        } => run_event(&services, &conversation_id, &event, message, false).await,
        Command::DryRun {
            conversation_id,
            event,
            message,
        } => run_event(&services, &conversation_id, &event, message, true).await,
    }
}

fn build_services(config: OutflowConfig) -> Result<Services> {
    let db_path = config.resolved_database_path();
    let store = Arc::new(Store::open(&db_path).context("opening store")?);
    let jobs_path = db_path.with_file_name("jobs.db");
    let jobs = Arc::new(JobStore::open(&jobs_path).context("opening job store")?);

    // Without a configured provider the worker runs with inert
    // collaborators — useful for local development and dry runs.
    let messenger: Arc<dyn Messenger> = if config.messaging.base_url.is_empty() {
        tracing::warn!("messaging.base_url not set, outbound delivery disabled");
        Arc::new(NoopMessenger::new())
    } else {
        Arc::new(HttpMessenger::new(&config.messaging)?)
    };
    let generator: Arc<dyn TextGenerator> = if config.generator.base_url.is_empty() {
        tracing::warn!("generator.base_url not set, using canned replies");
        Arc::new(StaticGenerator::new(""))
    } else {
        Arc::new(HttpGenerator::new(&config.generator)?)
    };

    let engine = WorkflowEngine::new(
        store.clone(),
        jobs.clone(),
        messenger.clone(),
        generator,
    );
    let limiter = InviteLimiter::new(store.clone());
    let sweeper = InviteSweeper::new(store.clone(), messenger.clone(), config.invites.clone());
    let mailer = Mailer::new(&config.email)?;

    Ok(Services {
        store,
        jobs,
        engine,
        limiter,
        sweeper,
        mailer,
        messenger,
        config,
    })
}

async fn serve(services: Arc<Services>) -> Result<()> {
    // The recurring expiration sweep; the dedup key keeps restarts from
    // stacking duplicates.
    services.jobs.enqueue(&Job::recurring(
        "invite_sweep:global".into(),
        JobKind::InviteSweep,
        services.config.invites.sweep_interval_secs,
    ))?;

    let policy = RetryPolicy {
        max_attempts: services.config.scheduler.max_attempts,
        base_delay_secs: services.config.scheduler.backoff_base_secs,
    };
    let handler = Arc::new(AppHandler {
        services: services.clone(),
    });
    let engine = Arc::new(
        SchedulerEngine::new(services.jobs.clone(), handler, policy)
            .with_batch_size(services.config.scheduler.batch_size),
    );

    let worker = spawn_scheduler(engine, services.config.scheduler.tick_secs);
    tracing::info!("outflow worker running, ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down, draining scheduler");
    worker.abort();
    let _ = worker.await;
    Ok(())
}

fn status(services: &Services) -> Result<()> {
    let stats = services.jobs.stats(chrono::Utc::now())?;
    println!("waiting:   {}", stats.waiting);
    println!("delayed:   {}", stats.delayed);
    println!("running:   {}", stats.running);
    println!("completed: {}", stats.completed);
    println!("parked:    {}", stats.parked);
    for job in services.jobs.failed()? {
        println!(
            "parked job {} ({}) attempts={} error={}",
            job.id,
            job.kind.as_str(),
            job.attempts,
            job.last_error.unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_event(
    services: &Services,
    conversation_id: &str,
    event: &str,
    message: Option<String>,
    dry_run: bool,
) -> Result<()> {
    let event = match event {
        "invite_accepted" => EventType::InviteAccepted,
        "invite_ignored" => EventType::InviteIgnored,
        "message_received" => EventType::MessageReceived,
        "no_response" => EventType::NoResponse,
        other => anyhow::bail!("unknown event type: {other}"),
    };
    let payload = EventPayload {
        message,
        ..EventPayload::default()
    };

    let outcome = services
        .engine
        .process_event_with_options(conversation_id, event, payload, dry_run)
        .await?;

    println!(
        "processed={} paused={} completed={}",
        outcome.processed, outcome.paused, outcome.completed
    );
    if let Some(reason) = &outcome.reason {
        println!("reason: {reason}");
    }
    for node in &outcome.executed_nodes {
        println!("  {} [{}] success={}", node.node_id, node.node_type, node.success);
    }
    for response in &outcome.responses {
        println!("  reply from {}: {}", response.node_id, response.text);
    }
    Ok(())
}

/// Routes claimed jobs to the right service. Handlers are idempotent —
/// the queue delivers at least once.
struct AppHandler {
    services: Arc<Services>,
}

#[async_trait::async_trait]
impl JobHandler for AppHandler {
    async fn handle(&self, job: &Job) -> outflow_core::Result<()> {
        match job.kind {
            JobKind::ResumeWorkflow => {
                let (Some(conversation_id), Some(node_id)) =
                    (&job.conversation_id, &job.node_id)
                else {
                    return Err(OutflowError::Validation(
                        "resume job without conversation/node".into(),
                    ));
                };
                self.services
                    .engine
                    .process_event(
                        conversation_id,
                        EventType::TimerFired {
                            node_id: node_id.clone(),
                        },
                        EventPayload::default(),
                    )
                    .await?;
                Ok(())
            }
            JobKind::SendInvite => self.send_invite(job).await,
            JobKind::SendEmail => {
                let to = job.payload["to"].as_str().ok_or_else(|| {
                    OutflowError::Validation("email job missing recipient".into())
                })?;
                let subject = job.payload["subject"].as_str().unwrap_or_default();
                let html = job.payload["html"].as_str().unwrap_or_default();
                self.services.mailer.send(to, subject, html).await
            }
            JobKind::InviteSweep => {
                self.services.sweeper.process_expired_invites().await?;
                Ok(())
            }
        }
    }
}

impl AppHandler {
    /// Send one queued connection request under the account's limits.
    /// A rate-limited attempt defers itself into the next send window via
    /// a day-stamped dedup key instead of burning retry attempts.
    async fn send_invite(&self, job: &Job) -> outflow_core::Result<()> {
        let services = &self.services;
        let queue_id = job.payload["queue_id"].as_str().ok_or_else(|| {
            OutflowError::Validation("invite job missing queue_id".into())
        })?;
        let Some(entry) = services.store.invite_queue_entry(queue_id)? else {
            return Err(OutflowError::Permanent(format!(
                "invite queue entry {queue_id} no longer exists"
            )));
        };
        if entry.status != "scheduled" && entry.status != "pending" {
            tracing::info!(queue_id, status = %entry.status, "invite already handled");
            return Ok(());
        }

        let allowance = services.limiter.can_send_invite(&entry.account_id)?;
        if !allowance.can_send {
            let reason = allowance.limit_reason.unwrap_or("limit");
            let next = outflow_engine::random_send_times(
                1,
                &services.config.invites,
                chrono::Utc::now() + chrono::Duration::hours(24),
            )
            .pop()
            .unwrap_or_else(|| chrono::Utc::now() + chrono::Duration::hours(24));
            let deferred_id = Job::account_key(
                JobKind::SendInvite,
                &entry.account_id,
                &format!("{}:{}", queue_id, next.format("%Y-%m-%d")),
            );
            services.jobs.enqueue(
                &Job::once(deferred_id, JobKind::SendInvite, job.payload.clone(), next)
                    .with_account(&entry.account_id),
            )?;
            tracing::warn!(queue_id, reason, "invite deferred, limit reached");
            return Ok(());
        }

        let lead = services.store.lead(&entry.lead_id)?.ok_or_else(|| {
            OutflowError::Permanent(format!("lead {} no longer exists", entry.lead_id))
        })?;
        let Some(profile_id) = &lead.profile_id else {
            return Err(OutflowError::Validation(format!(
                "lead {} has no provider profile id",
                entry.lead_id
            )));
        };

        // Personalized note only when the monthly noted-invite window has
        // room; plain invites are not subject to that cap.
        let note = job.payload["note"].as_str().filter(|n| !n.is_empty());
        let note = if allowance.can_send_with_message {
            let cap = services.limiter.note_char_limit(&entry.account_id)?;
            note.map(|n| n.chars().take(cap).collect::<String>())
        } else {
            None
        };
        let with_note = note.is_some();

        let sent = services
            .messenger
            .send_connection_request(&entry.account_id, profile_id, note.as_deref())
            .await;

        match sent {
            Ok(()) => {
                services.limiter.log_invite_sent(
                    &entry.account_id,
                    entry.campaign_id.as_deref(),
                    Some(&entry.lead_id),
                    "sent",
                    with_note,
                )?;
                let expires = chrono::Utc::now()
                    + chrono::Duration::days(services.config.invites.expiry_days);
                services.store.mark_invite_sent(queue_id, expires)?;
                services.store.set_lead_status(&entry.lead_id, "invite_sent")?;
                tracing::info!(queue_id, lead = %entry.lead_id, with_note, "invite sent");
                Ok(())
            }
            Err(e) => {
                services.limiter.log_invite_sent(
                    &entry.account_id,
                    entry.campaign_id.as_deref(),
                    Some(&entry.lead_id),
                    "failed",
                    with_note,
                )?;
                Err(e)
            }
        }
    }
}

