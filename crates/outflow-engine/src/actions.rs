//! Action executors — the side-effecting behavior of action nodes.
//!
//! Every action kind is a variant of [`ActionSpec`]; adding a kind means
//! adding a variant and handling it in the exhaustive match below. In test
//! mode every executor short-circuits to a `simulated: true` result with no
//! external calls and no persistence.

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use outflow_core::error::{OutflowError, Result};
use outflow_core::template;
use outflow_core::traits::Messenger;
use outflow_core::types::ExecutionContext;
use outflow_db::Store;
use outflow_scheduler::{Job, JobKind, JobStore};

use crate::rotation::RotationService;

/// Fixed per-kind control-flow flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionFlags {
    pub has_output: bool,
    pub ends_branch: bool,
    pub pauses_workflow: bool,
}

/// A tag given by name or by name+color.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagSpec {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        color: Option<String>,
    },
}

impl TagSpec {
    pub fn name(&self) -> &str {
        match self {
            TagSpec::Name(n) => n,
            TagSpec::Full { name, .. } => name,
        }
    }

    pub fn color(&self) -> &str {
        match self {
            TagSpec::Full {
                color: Some(color), ..
            } => color,
            _ => "gray",
        }
    }
}

/// Units for `wait` durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl WaitUnit {
    pub fn to_seconds(&self, value: u64) -> i64 {
        let factor = match self {
            WaitUnit::Seconds => 1,
            WaitUnit::Minutes => 60,
            WaitUnit::Hours => 3600,
            WaitUnit::Days => 86400,
        };
        (value as i64).saturating_mul(factor)
    }
}

/// One dot-path extraction from an HTTP response into a workflow variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub path: String,
    pub var: String,
}

/// The closed set of action kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionSpec {
    /// Hand the conversation to a human (explicit user, sector round-robin,
    /// or explicit user within a sector).
    Transfer {
        #[serde(default)]
        user_id: Option<i64>,
        #[serde(default)]
        sector_id: Option<String>,
        #[serde(default)]
        sector_user_id: Option<i64>,
        #[serde(default)]
        message: Option<String>,
    },
    SendMessage {
        message: String,
        /// Defaults to true: downstream progress gates on a reply.
        #[serde(default = "default_true")]
        wait_for_response: bool,
    },
    /// Send the scheduling link.
    Schedule {
        scheduling_link: String,
    },
    AddTag {
        #[serde(default)]
        tags: Vec<TagSpec>,
    },
    RemoveTag {
        #[serde(default)]
        tags: Vec<TagSpec>,
        #[serde(default)]
        remove_all: bool,
    },
    ClosePositive {
        #[serde(default)]
        message: Option<String>,
    },
    CloseNegative {
        #[serde(default)]
        message: Option<String>,
    },
    AssignAgent {
        #[serde(default)]
        user_id: Option<i64>,
        #[serde(default)]
        use_round_robin: bool,
    },
    SendEmail {
        #[serde(default)]
        subject: String,
        #[serde(default)]
        body: String,
    },
    Webhook {
        url: String,
    },
    HttpRequest {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
        #[serde(default)]
        query: Vec<(String, String)>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        extract: Vec<Extraction>,
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
    },
    /// Fixed or random-range pause.
    Pause {
        #[serde(default)]
        duration_secs: Option<u64>,
        #[serde(default)]
        min_secs: Option<u64>,
        #[serde(default)]
        max_secs: Option<u64>,
    },
    /// Unit-based wait ({value, unit}).
    Wait {
        value: u64,
        unit: WaitUnit,
    },
    CreateOpportunity {
        pipeline_id: String,
        stage_id: String,
    },
    MoveStage {
        stage_id: String,
    },
}

fn default_true() -> bool {
    true
}
fn default_method() -> String {
    "GET".into()
}
fn default_http_timeout() -> u64 {
    15
}

impl ActionSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionSpec::Transfer { .. } => "transfer",
            ActionSpec::SendMessage { .. } => "send_message",
            ActionSpec::Schedule { .. } => "schedule",
            ActionSpec::AddTag { .. } => "add_tag",
            ActionSpec::RemoveTag { .. } => "remove_tag",
            ActionSpec::ClosePositive { .. } => "close_positive",
            ActionSpec::CloseNegative { .. } => "close_negative",
            ActionSpec::AssignAgent { .. } => "assign_agent",
            ActionSpec::SendEmail { .. } => "send_email",
            ActionSpec::Webhook { .. } => "webhook",
            ActionSpec::HttpRequest { .. } => "http_request",
            ActionSpec::Pause { .. } => "pause",
            ActionSpec::Wait { .. } => "wait",
            ActionSpec::CreateOpportunity { .. } => "create_opportunity",
            ActionSpec::MoveStage { .. } => "move_stage",
        }
    }

    /// Control-flow flags, fixed per kind.
    pub fn flags(&self) -> ActionFlags {
        match self {
            ActionSpec::Transfer { .. }
            | ActionSpec::ClosePositive { .. }
            | ActionSpec::CloseNegative { .. } => ActionFlags {
                has_output: false,
                ends_branch: true,
                pauses_workflow: false,
            },
            ActionSpec::Pause { .. } | ActionSpec::Wait { .. } => ActionFlags {
                has_output: true,
                ends_branch: false,
                pauses_workflow: true,
            },
            _ => ActionFlags {
                has_output: true,
                ends_branch: false,
                pauses_workflow: false,
            },
        }
    }

    /// Whether a replayed execution would repeat an external side effect.
    /// The engine skips these when the step already ran for the same
    /// logical event delivery.
    pub fn externally_effectful(&self) -> bool {
        matches!(
            self,
            ActionSpec::Transfer { .. }
                | ActionSpec::SendMessage { .. }
                | ActionSpec::Schedule { .. }
                | ActionSpec::AssignAgent { .. }
                | ActionSpec::SendEmail { .. }
                | ActionSpec::Webhook { .. }
                | ActionSpec::HttpRequest { .. }
        )
    }
}

/// Result of executing one action node.
#[derive(Debug, Clone)]
pub struct ActionExecutionResult {
    pub success: bool,
    pub action_type: &'static str,
    pub result: serde_json::Value,
    pub duration_ms: u64,
    pub flags: ActionFlags,
    /// Branch path for branching actions (`http_request`).
    pub branch: Option<String>,
    /// `send_message` with wait_for_response: progress gates on a reply.
    pub wait_for_response: bool,
    /// Pause/wait actions: how long until the resume job should fire.
    pub resume_delay_secs: Option<i64>,
}

/// Executes action nodes against the store and the collaborators.
pub struct ActionExecutor {
    store: Arc<Store>,
    jobs: Arc<JobStore>,
    messenger: Arc<dyn Messenger>,
    rotation: RotationService,
    http: reqwest::Client,
}

impl ActionExecutor {
    pub fn new(store: Arc<Store>, jobs: Arc<JobStore>, messenger: Arc<dyn Messenger>) -> Self {
        let rotation = RotationService::new(store.clone());
        Self {
            store,
            jobs,
            messenger,
            rotation,
            http: reqwest::Client::new(),
        }
    }

    /// Execute one action node.
    pub async fn execute(
        &self,
        node_id: &str,
        spec: &ActionSpec,
        ctx: &ExecutionContext,
    ) -> Result<ActionExecutionResult> {
        let started = Instant::now();
        let flags = spec.flags();
        tracing::debug!(node_id, action = spec.kind(), test = ctx.is_test_mode, "executing action");

        let mut branch = None;
        let mut wait_for_response = false;
        let mut resume_delay_secs = None;

        let result = match spec {
            ActionSpec::Transfer {
                user_id,
                sector_id,
                sector_user_id,
                message,
            } => {
                self.transfer(ctx, *user_id, sector_id.as_deref(), *sector_user_id, message.as_deref())
                    .await?
            }
            ActionSpec::SendMessage {
                message,
                wait_for_response: wait,
            } => {
                wait_for_response = *wait;
                self.send_message(ctx, message, *wait).await?
            }
            ActionSpec::Schedule { scheduling_link } => {
                self.schedule(ctx, scheduling_link).await?
            }
            ActionSpec::AddTag { tags } => self.add_tags(ctx, tags)?,
            ActionSpec::RemoveTag { tags, remove_all } => {
                self.remove_tags(ctx, tags, *remove_all)?
            }
            ActionSpec::ClosePositive { message } => {
                self.close(ctx, true, message.as_deref()).await?
            }
            ActionSpec::CloseNegative { message } => {
                self.close(ctx, false, message.as_deref()).await?
            }
            ActionSpec::AssignAgent {
                user_id,
                use_round_robin,
            } => self.assign_agent(ctx, *user_id, *use_round_robin)?,
            ActionSpec::SendEmail { subject, body } => {
                self.send_email(ctx, node_id, subject, body)?
            }
            ActionSpec::Webhook { url } => self.webhook(ctx, url).await?,
            ActionSpec::HttpRequest {
                url,
                method,
                headers,
                query,
                body,
                extract,
                timeout_secs,
            } => {
                let (value, path) = self
                    .http_request(ctx, url, method, headers, query, body.as_deref(), extract, *timeout_secs)
                    .await?;
                branch = Some(path);
                value
            }
            ActionSpec::Pause {
                duration_secs,
                min_secs,
                max_secs,
            } => {
                let secs = resolve_pause_secs(*duration_secs, *min_secs, *max_secs);
                resume_delay_secs = Some(secs);
                serde_json::json!({
                    "is_wait": true,
                    "wait_secs": secs,
                    "duration": format_duration(secs),
                    "resume_at": (Utc::now() + Duration::seconds(secs)).to_rfc3339(),
                    "simulated": ctx.is_test_mode,
                })
            }
            ActionSpec::Wait { value, unit } => {
                let secs = unit.to_seconds(*value);
                resume_delay_secs = Some(secs);
                serde_json::json!({
                    "is_wait": true,
                    "wait_secs": secs,
                    "wait_value": value,
                    "wait_unit": unit,
                    "duration": format_duration(secs),
                    "resume_at": (Utc::now() + Duration::seconds(secs)).to_rfc3339(),
                    "simulated": ctx.is_test_mode,
                })
            }
            ActionSpec::CreateOpportunity {
                pipeline_id,
                stage_id,
            } => self.create_opportunity(ctx, pipeline_id, stage_id)?,
            ActionSpec::MoveStage { stage_id } => self.move_stage(ctx, stage_id)?,
        };

        Ok(ActionExecutionResult {
            success: true,
            action_type: spec.kind(),
            result,
            duration_ms: started.elapsed().as_millis() as u64,
            flags,
            branch,
            wait_for_response,
            resume_delay_secs,
        })
    }

    // ─── transfer ──────────────────────────────────────

    async fn transfer(
        &self,
        ctx: &ExecutionContext,
        user_id: Option<i64>,
        sector_id: Option<&str>,
        sector_user_id: Option<i64>,
        message: Option<&str>,
    ) -> Result<serde_json::Value> {
        if ctx.is_test_mode {
            return Ok(serde_json::json!({
                "simulated": true,
                "target_user": user_id.or(sector_user_id),
                "sector_id": sector_id,
            }));
        }

        let (assigned_id, assigned_name) = match (user_id, sector_id, sector_user_id) {
            (Some(uid), _, _) | (None, Some(_), Some(uid)) => {
                let user = self.store.user(uid)?.ok_or_else(|| {
                    OutflowError::Permanent(format!("transfer target user {uid} not found"))
                })?;
                (user.id, user.name)
            }
            (None, Some(sector), None) => {
                // Sector round-robin. Agents without a configured rotation
                // get one seeded from the sector's active users.
                let assignee = match self.rotation.get_next_assignee(ctx.agent_id)? {
                    Some(a) => a,
                    None => {
                        let users = self.store.active_sector_users(sector)?;
                        if users.is_empty() {
                            return Err(OutflowError::Validation(format!(
                                "no active users in sector {sector}"
                            )));
                        }
                        let ids: Vec<i64> = users.iter().map(|u| u.id).collect();
                        self.store.set_assignees(ctx.agent_id, &ids)?;
                        self.rotation.get_next_assignee(ctx.agent_id)?.ok_or_else(|| {
                            OutflowError::StateInconsistency(
                                "rotation empty after seeding from sector".into(),
                            )
                        })?
                    }
                };
                (assignee.user_id, assignee.user_name)
            }
            (None, None, _) => {
                return Err(OutflowError::Validation(
                    "transfer needs a user or a sector".into(),
                ));
            }
        };

        self.store
            .disable_automation(&ctx.conversation_id, "workflow_transfer", Some(assigned_id))?;
        tracing::info!(
            conversation = %ctx.conversation_id,
            user = assigned_id,
            "conversation transferred"
        );

        if let Some(message) = message {
            let rendered = template::process(message, &ctx.template_vars());
            if let Err(e) = self.deliver(ctx, &rendered).await {
                tracing::warn!("transfer farewell failed: {e}");
            }
        }

        if let Err(e) = self.store.insert_notification(
            &ctx.account_id,
            Some(assigned_id),
            "handoff",
            "Nova conversa transferida",
            "Uma conversa foi transferida para você via workflow.",
            Some(&ctx.conversation_id),
            &serde_json::json!({"reason": "workflow_transfer"}),
        ) {
            tracing::warn!("transfer notification failed: {e}");
        }

        Ok(serde_json::json!({
            "transferred": true,
            "assigned_user_id": assigned_id,
            "assigned_user_name": assigned_name,
            "sector_id": sector_id,
        }))
    }

    // ─── messaging ──────────────────────────────────────

    async fn send_message(
        &self,
        ctx: &ExecutionContext,
        message: &str,
        wait_for_response: bool,
    ) -> Result<serde_json::Value> {
        if message.is_empty() {
            return Err(OutflowError::Validation("message content is required".into()));
        }
        let rendered = template::process(message, &ctx.template_vars());

        if ctx.is_test_mode {
            return Ok(serde_json::json!({
                "simulated": true,
                "message": rendered,
                "wait_for_response": wait_for_response,
            }));
        }

        self.deliver(ctx, &rendered).await?;
        self.store
            .update_last_message(&ctx.conversation_id, &rendered)?;

        Ok(serde_json::json!({
            "sent": true,
            "message": rendered,
            "wait_for_response": wait_for_response,
        }))
    }

    async fn schedule(
        &self,
        ctx: &ExecutionContext,
        scheduling_link: &str,
    ) -> Result<serde_json::Value> {
        if scheduling_link.is_empty() {
            return Err(OutflowError::Validation("scheduling link not configured".into()));
        }
        let link = template::process(scheduling_link, &ctx.template_vars());
        let message = format!("Para facilitar, você pode agendar diretamente aqui: {link}");

        if ctx.is_test_mode {
            return Ok(serde_json::json!({"simulated": true, "link": link, "message": message}));
        }

        self.deliver(ctx, &message).await?;
        Ok(serde_json::json!({"sent": true, "link": link}))
    }

    /// Deliver via the messaging collaborator, persisting the outcome
    /// either way — a failed send leaves a `send_failed` row, not silence.
    async fn deliver(&self, ctx: &ExecutionContext, text: &str) -> Result<()> {
        let recipient = ctx.lead.profile_id.clone().ok_or_else(|| {
            OutflowError::Validation("lead has no provider profile id".into())
        })?;
        match self
            .messenger
            .send_message(&ctx.account_id, &recipient, text)
            .await
        {
            Ok(()) => {
                self.store
                    .insert_message(&ctx.conversation_id, "ai", text, "sent")?;
                Ok(())
            }
            Err(e) => {
                self.store
                    .insert_message(&ctx.conversation_id, "ai", text, "send_failed")?;
                Err(e)
            }
        }
    }

    // ─── tags ──────────────────────────────────────

    fn add_tags(&self, ctx: &ExecutionContext, tags: &[TagSpec]) -> Result<serde_json::Value> {
        if tags.is_empty() {
            return Ok(serde_json::json!({"added": 0}));
        }
        if ctx.is_test_mode {
            let names: Vec<&str> = tags.iter().map(|t| t.name()).collect();
            return Ok(serde_json::json!({"simulated": true, "tags": names}));
        }
        for tag in tags {
            self.store.add_tag(&ctx.lead.id, tag.name(), tag.color())?;
        }
        Ok(serde_json::json!({
            "added": tags.len(),
            "tags": tags.iter().map(|t| t.name()).collect::<Vec<_>>(),
        }))
    }

    fn remove_tags(
        &self,
        ctx: &ExecutionContext,
        tags: &[TagSpec],
        remove_all: bool,
    ) -> Result<serde_json::Value> {
        if ctx.is_test_mode {
            return Ok(serde_json::json!({"simulated": true, "remove_all": remove_all}));
        }
        if remove_all {
            self.store.remove_all_tags(&ctx.lead.id)?;
            return Ok(serde_json::json!({"removed_all": true}));
        }
        for tag in tags {
            self.store.remove_tag(&ctx.lead.id, tag.name())?;
        }
        Ok(serde_json::json!({"removed": tags.len()}))
    }

    // ─── closing ──────────────────────────────────────

    async fn close(
        &self,
        ctx: &ExecutionContext,
        positive: bool,
        message: Option<&str>,
    ) -> Result<serde_json::Value> {
        let status = if positive { "positive" } else { "negative" };
        if ctx.is_test_mode {
            return Ok(serde_json::json!({"simulated": true, "status": status}));
        }

        self.store.close_conversation(&ctx.conversation_id, positive)?;

        if let Some(message) = message {
            let rendered = template::process(message, &ctx.template_vars());
            if let Err(e) = self.deliver(ctx, &rendered).await {
                tracing::warn!("closing message failed: {e}");
            }
        }

        Ok(serde_json::json!({
            "closed": true,
            "status": status,
            "lead_status": if positive { "qualified" } else { "not_interested" },
        }))
    }

    // ─── assignment ──────────────────────────────────────

    fn assign_agent(
        &self,
        ctx: &ExecutionContext,
        user_id: Option<i64>,
        use_round_robin: bool,
    ) -> Result<serde_json::Value> {
        if ctx.is_test_mode {
            return Ok(serde_json::json!({
                "simulated": true,
                "assigned_to": user_id.map(|u| u.to_string()).unwrap_or_else(|| "round_robin".into()),
            }));
        }

        let assignee_id = match (user_id, use_round_robin) {
            (Some(uid), false) => uid,
            _ => self
                .rotation
                .get_next_assignee(ctx.agent_id)?
                .map(|a| a.user_id)
                .ok_or_else(|| {
                    OutflowError::Validation("no user available for assignment".into())
                })?,
        };

        self.store
            .assign_conversation(&ctx.conversation_id, assignee_id)?;
        Ok(serde_json::json!({"assigned": true, "user_id": assignee_id}))
    }

    // ─── email ──────────────────────────────────────

    fn send_email(
        &self,
        ctx: &ExecutionContext,
        node_id: &str,
        subject: &str,
        body: &str,
    ) -> Result<serde_json::Value> {
        let to = ctx
            .lead
            .email
            .clone()
            .ok_or_else(|| OutflowError::Validation("lead has no email address".into()))?;
        let vars = ctx.template_vars();
        let subject = template::process(subject, &vars);
        let body = template::process(body, &vars);

        if ctx.is_test_mode {
            return Ok(serde_json::json!({
                "simulated": true,
                "to": to,
                "subject": subject,
            }));
        }

        // Enqueue, don't block: delivery happens in its own job.
        let job = Job::once(
            Job::dedup_key(JobKind::SendEmail, &ctx.conversation_id, Some(node_id)),
            JobKind::SendEmail,
            serde_json::json!({"to": to, "subject": subject, "html": body}),
            Utc::now(),
        )
        .with_conversation(&ctx.conversation_id);
        self.jobs.enqueue(&job)?;

        Ok(serde_json::json!({"queued": true, "to": to, "subject": subject}))
    }

    // ─── HTTP ──────────────────────────────────────

    async fn webhook(&self, ctx: &ExecutionContext, url: &str) -> Result<serde_json::Value> {
        reqwest::Url::parse(url)
            .map_err(|e| OutflowError::Validation(format!("invalid webhook URL {url}: {e}")))?;

        let payload = serde_json::json!({
            "event": "workflow_action",
            "timestamp": Utc::now().to_rfc3339(),
            "conversation_id": ctx.conversation_id,
            "agent_id": ctx.agent_id,
            "lead": {
                "id": ctx.lead.id,
                "name": ctx.lead.name,
                "email": ctx.lead.email,
                "company": ctx.lead.company,
            },
            "variables": ctx.variables,
        });

        if ctx.is_test_mode {
            return Ok(serde_json::json!({"simulated": true, "url": url, "payload": payload}));
        }

        let response = self
            .http
            .post(url)
            .header("X-Workflow-Event", "action")
            .json(&payload)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| OutflowError::ExternalService(format!("webhook failed: {e}")))?;

        Ok(serde_json::json!({
            "sent": true,
            "url": url,
            "status_code": response.status().as_u16(),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn http_request(
        &self,
        ctx: &ExecutionContext,
        url: &str,
        method: &str,
        headers: &[(String, String)],
        query: &[(String, String)],
        body: Option<&str>,
        extract: &[Extraction],
        timeout_secs: u64,
    ) -> Result<(serde_json::Value, String)> {
        let vars = ctx.template_vars();
        let url = template::process(url, &vars);
        reqwest::Url::parse(&url)
            .map_err(|e| OutflowError::Validation(format!("invalid URL {url}: {e}")))?;

        if ctx.is_test_mode {
            return Ok((
                serde_json::json!({"simulated": true, "url": url, "method": method}),
                "success".into(),
            ));
        }

        let mut request = match method.to_uppercase().as_str() {
            "GET" => self.http.get(&url),
            "POST" => self.http.post(&url),
            "PUT" => self.http.put(&url),
            "PATCH" => self.http.patch(&url),
            "DELETE" => self.http.delete(&url),
            other => {
                return Err(OutflowError::Validation(format!(
                    "unsupported method: {other}"
                )));
            }
        };
        for (key, value) in headers {
            request = request.header(key.as_str(), template::process(value, &vars));
        }
        let rendered_query: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (k.clone(), template::process(v, &vars)))
            .collect();
        if !rendered_query.is_empty() {
            request = request.query(&rendered_query);
        }
        if let Some(body) = body {
            let rendered = template::process(body, &vars);
            if rendered.starts_with('{') || rendered.starts_with('[') {
                request = request.header("Content-Type", "application/json");
            }
            request = request.body(rendered);
        }

        let response = request
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .send()
            .await
            .map_err(|e| OutflowError::ExternalService(format!("http_request failed: {e}")))?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let json_body: Option<serde_json::Value> = serde_json::from_str(&text).ok();

        let path = status_branch(status);

        // Extract variables only on success and only from a JSON body.
        let mut extracted = serde_json::Map::new();
        if path == "success"
            && let Some(json_body) = &json_body
        {
            extracted = extract_variables(json_body, extract);
            for (var, value) in &extracted {
                self.store
                    .set_workflow_variable(&ctx.conversation_id, var, value)?;
            }
        }

        Ok((
            serde_json::json!({
                "status": status,
                "path": path,
                "variables": extracted,
            }),
            path.to_string(),
        ))
    }

    // ─── pipeline ──────────────────────────────────────

    fn create_opportunity(
        &self,
        ctx: &ExecutionContext,
        pipeline_id: &str,
        stage_id: &str,
    ) -> Result<serde_json::Value> {
        if ctx.is_test_mode {
            return Ok(serde_json::json!({
                "simulated": true,
                "pipeline_id": pipeline_id,
                "stage_id": stage_id,
            }));
        }
        let (id, created) =
            self.store
                .find_or_create_opportunity(&ctx.lead.id, pipeline_id, stage_id)?;
        Ok(serde_json::json!({
            "opportunity_id": id,
            "created": created,
            "existed": !created,
        }))
    }

    fn move_stage(&self, ctx: &ExecutionContext, stage_id: &str) -> Result<serde_json::Value> {
        if ctx.is_test_mode {
            return Ok(serde_json::json!({"simulated": true, "stage_id": stage_id}));
        }
        let mv = self.store.move_opportunity_stage(&ctx.lead.id, stage_id)?;
        Ok(serde_json::json!({
            "moved": mv.moved,
            "opportunity_id": mv.opportunity_id,
            "reason": mv.reason,
        }))
    }
}

/// Branch path by HTTP status class: 2xx routes `success`, everything
/// else routes `error`.
fn status_branch(status: u16) -> &'static str {
    if (200..300).contains(&status) {
        "success"
    } else {
        "error"
    }
}

/// Pull the configured dot paths out of a JSON response body. Missing
/// paths are skipped, not errors.
fn extract_variables(
    body: &serde_json::Value,
    extract: &[Extraction],
) -> serde_json::Map<String, serde_json::Value> {
    let mut extracted = serde_json::Map::new();
    for extraction in extract {
        if let Some(value) = template::extract_json_path(body, &extraction.path) {
            extracted.insert(extraction.var.clone(), value.clone());
        }
    }
    extracted
}

/// Pause duration: random within [min, max] when both bounds are given,
/// else the fixed duration, else one hour.
fn resolve_pause_secs(
    duration_secs: Option<u64>,
    min_secs: Option<u64>,
    max_secs: Option<u64>,
) -> i64 {
    match (min_secs, max_secs) {
        (Some(min), Some(max)) if max >= min => {
            rand::thread_rng().gen_range(min..=max) as i64
        }
        _ => duration_secs.unwrap_or(3600) as i64,
    }
}

fn format_duration(secs: i64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_per_kind() {
        let transfer: ActionSpec = serde_json::from_value(serde_json::json!({
            "action": "transfer", "user_id": 1
        }))
        .unwrap();
        assert!(transfer.flags().ends_branch);
        assert!(!transfer.flags().has_output);

        let wait: ActionSpec = serde_json::from_value(serde_json::json!({
            "action": "wait", "value": 24, "unit": "hours"
        }))
        .unwrap();
        assert!(wait.flags().pauses_workflow);
        assert!(!wait.flags().ends_branch);

        let tag: ActionSpec = serde_json::from_value(serde_json::json!({
            "action": "add_tag", "tags": ["vip"]
        }))
        .unwrap();
        assert!(tag.flags().has_output);
        assert!(!tag.externally_effectful());

        let msg: ActionSpec = serde_json::from_value(serde_json::json!({
            "action": "send_message", "message": "hi"
        }))
        .unwrap();
        assert!(msg.externally_effectful());
    }

    #[test]
    fn test_wait_unit_seconds() {
        assert_eq!(WaitUnit::Hours.to_seconds(24), 86400);
        assert_eq!(WaitUnit::Minutes.to_seconds(5), 300);
        assert_eq!(WaitUnit::Days.to_seconds(2), 172800);
    }

    #[test]
    fn test_pause_resolution() {
        assert_eq!(resolve_pause_secs(Some(120), None, None), 120);
        assert_eq!(resolve_pause_secs(None, None, None), 3600);
        let random = resolve_pause_secs(None, Some(60), Some(120));
        assert!((60..=120).contains(&random));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(300), "5m");
        assert_eq!(format_duration(7200), "2h");
        assert_eq!(format_duration(172800), "2d");
    }

    #[test]
    fn test_status_class_routing() {
        assert_eq!(status_branch(200), "success");
        assert_eq!(status_branch(204), "success");
        assert_eq!(status_branch(301), "error");
        assert_eq!(status_branch(404), "error");
        assert_eq!(status_branch(500), "error");
    }

    #[test]
    fn test_response_extraction_by_dot_path() {
        let body = serde_json::json!({"status": "ok", "data": {"score": 87}});
        let extract = vec![
            Extraction {
                path: "status".into(),
                var: "varStatus".into(),
            },
            Extraction {
                path: "data.score".into(),
                var: "score".into(),
            },
            Extraction {
                path: "data.missing".into(),
                var: "never".into(),
            },
        ];
        let vars = extract_variables(&body, &extract);
        assert_eq!(vars["varStatus"], serde_json::json!("ok"));
        assert_eq!(vars["score"], serde_json::json!(87));
        assert!(!vars.contains_key("never"));
    }

    #[test]
    fn test_send_message_defaults_wait_for_response() {
        let spec: ActionSpec = serde_json::from_value(serde_json::json!({
            "action": "send_message", "message": "Olá {{first_name}}"
        }))
        .unwrap();
        match spec {
            ActionSpec::SendMessage {
                wait_for_response, ..
            } => assert!(wait_for_response),
            _ => unreachable!(),
        }
    }
}
