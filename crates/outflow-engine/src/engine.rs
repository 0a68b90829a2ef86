//! Workflow execution engine.
//!
//! Walks the node graph for one conversation in response to an event,
//! persisting state between suspensions. Generated messages are collected
//! and returned to the caller — the engine never delivers them itself, so
//! a single turn can batch several messages.

use std::sync::Arc;

use chrono::{Duration, Utc};

use outflow_core::error::{OutflowError, Result};
use outflow_core::traits::{Messenger, TextGenerator};
use outflow_core::types::{EventPayload, EventType, ExecutionContext, GenerateRequest};
use outflow_db::{StepRecord, Store, WorkflowStateRecord, WorkflowStatus};
use outflow_scheduler::{Job, JobStore};

use crate::actions::ActionExecutor;
use crate::graph::{Node, NodeKind, WorkflowGraph};

/// Reply-evaluation attempts allowed when a step has no explicit bound.
const UNLIMITED_ATTEMPTS: u32 = 9999;

/// Hard bound on nodes executed per pass; only a cyclic graph gets close.
const MAX_NODES_PER_PASS: usize = 200;

/// One node executed during a pass.
#[derive(Debug, Clone)]
pub struct ExecutedNode {
    pub node_id: String,
    pub node_type: &'static str,
    pub success: bool,
    pub result: serde_json::Value,
}

/// A message produced for the caller to deliver.
#[derive(Debug, Clone)]
pub struct GeneratedMessage {
    pub node_id: String,
    pub text: String,
}

/// Outcome of processing one event.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub processed: bool,
    pub reason: Option<String>,
    pub executed_nodes: Vec<ExecutedNode>,
    pub responses: Vec<GeneratedMessage>,
    pub paused: bool,
    pub completed: bool,
    pub final_node_id: Option<String>,
}

impl ProcessOutcome {
    fn skipped(reason: &str) -> Self {
        Self {
            processed: false,
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

pub struct WorkflowEngine {
    store: Arc<Store>,
    jobs: Arc<JobStore>,
    executor: ActionExecutor,
    generator: Arc<dyn TextGenerator>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<Store>,
        jobs: Arc<JobStore>,
        messenger: Arc<dyn Messenger>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        let executor = ActionExecutor::new(store.clone(), jobs.clone(), messenger);
        Self {
            store,
            jobs,
            executor,
            generator,
        }
    }

    /// Create the workflow state for a new conversation, positioned at the
    /// trigger matching `trigger_event`. Returns `None` when the agent has
    /// no enabled workflow.
    pub fn initialize_workflow(
        &self,
        conversation_id: &str,
        agent_id: i64,
        trigger_event: Option<&str>,
    ) -> Result<Option<WorkflowStateRecord>> {
        let Some(agent) = self.store.agent(agent_id)? else {
            return Err(OutflowError::Permanent(format!("agent {agent_id} not found")));
        };
        if !agent.workflow_enabled {
            return Ok(None);
        }
        let Some(definition) = &agent.workflow_definition else {
            return Ok(None);
        };
        let graph = WorkflowGraph::from_json(definition)?;
        let trigger = match trigger_event {
            Some(event) => graph.trigger_for_event(event),
            None => graph
                .nodes
                .iter()
                .find(|n| matches!(n.kind, NodeKind::Trigger { .. })),
        };
        let state = self.store.init_workflow_state(
            conversation_id,
            agent_id,
            trigger.map(|n| n.id.as_str()),
        )?;
        tracing::info!(
            conversation_id,
            agent_id,
            start = ?state.current_node_id,
            "workflow initialized"
        );
        Ok(Some(state))
    }

    /// Process one event for a conversation.
    pub async fn process_event(
        &self,
        conversation_id: &str,
        event: EventType,
        payload: EventPayload,
    ) -> Result<ProcessOutcome> {
        self.process_event_with_options(conversation_id, event, payload, false)
            .await
    }

    /// Like [`WorkflowEngine::process_event`] with an explicit dry-run flag.
    /// In test mode every executor simulates and no timers are scheduled.
    pub async fn process_event_with_options(
        &self,
        conversation_id: &str,
        event: EventType,
        payload: EventPayload,
        is_test_mode: bool,
    ) -> Result<ProcessOutcome> {
        tracing::debug!(conversation_id, event = event.name(), "processing event");

        let Some(mut state) = self.store.workflow_state(conversation_id)? else {
            return Ok(ProcessOutcome::skipped("no_workflow_state"));
        };
        if state.status == WorkflowStatus::Completed {
            return Ok(ProcessOutcome::skipped("workflow_completed"));
        }

        let Some(agent) = self.store.agent(state.agent_id)? else {
            return Err(OutflowError::Permanent(format!(
                "agent {} no longer exists",
                state.agent_id
            )));
        };
        let Some(definition) = &agent.workflow_definition else {
            return Ok(ProcessOutcome::skipped("workflow_disabled"));
        };
        let graph = WorkflowGraph::from_json(definition)?;

        // Paused workflows only react to the event they are waiting for.
        if state.status == WorkflowStatus::Paused {
            match &event {
                EventType::TimerFired { node_id } => {
                    if state.resume_node_id.as_deref() == Some(node_id.as_str()) {
                        state = self.store.resume_workflow(conversation_id)?;
                    } else {
                        // Duplicate or stale resume job: idempotent no-op.
                        return Ok(ProcessOutcome::skipped("stale_resume"));
                    }
                }
                EventType::MessageReceived => {
                    if state.paused_reason.as_deref() == Some("waiting_for_response") {
                        // A reply obsoletes any scheduled wait.
                        let cancelled = self.jobs.cancel_for_conversation(conversation_id)?;
                        if cancelled > 0 {
                            tracing::debug!(conversation_id, cancelled, "cancelled pending timers");
                        }
                        state = self.store.resume_workflow(conversation_id)?;
                    } else {
                        return Ok(ProcessOutcome::skipped("workflow_paused"));
                    }
                }
                _ => return Ok(ProcessOutcome::skipped("workflow_paused")),
            }
        } else if let EventType::TimerFired { node_id } = &event {
            // Active + timer: legitimate only when a crashed pass already
            // applied the resume; re-walk from the same node, the event-key
            // history check downgrades completed side effects to no-ops.
            if state.current_node_id.as_deref() != Some(node_id.as_str()) {
                return Ok(ProcessOutcome::skipped("stale_resume"));
            }
        }

        let ctx = self.build_context(&state, &event, &payload, is_test_mode)?;

        // Start node: the persisted cursor, falling back to the trigger for
        // this event. A trigger cursor that doesn't match the event is
        // re-resolved so a second trigger can gate its own entry point.
        let mut current: &Node = match state
            .current_node_id
            .as_ref()
            .and_then(|id| graph.node(id))
        {
            Some(node) => match &node.kind {
                NodeKind::Trigger { event: trigger_event }
                    if trigger_event != event.name() =>
                {
                    match graph.trigger_for_event(event.name()) {
                        Some(trigger) => trigger,
                        None => return Ok(ProcessOutcome::skipped("no_node_for_event")),
                    }
                }
                _ => node,
            },
            None => match graph.trigger_for_event(event.name()) {
                Some(trigger) => trigger,
                None => return Ok(ProcessOutcome::skipped("no_node_for_event")),
            },
        };

        let mut history = state.step_history.clone();
        let mut outcome = ProcessOutcome {
            processed: true,
            ..ProcessOutcome::default()
        };

        let mut visited = 0usize;
        loop {
            visited += 1;
            if visited > MAX_NODES_PER_PASS {
                return Err(OutflowError::StateInconsistency(format!(
                    "{} nodes executed in one pass, workflow graph likely cycles",
                    MAX_NODES_PER_PASS
                )));
            }
            tracing::debug!(node = %current.id, kind = current.node_type(), "executing node");
            let mut branch_path: Option<String> = None;

            match &current.kind {
                NodeKind::Trigger { event: trigger_event } => {
                    let result = serde_json::json!({"event": trigger_event, "matched": true});
                    self.record(&mut history, &mut outcome, current, &ctx, true, result)?;
                }

                NodeKind::Condition { condition } => {
                    let evaluated = condition.evaluate(&ctx);
                    branch_path = Some(evaluated.path.to_string());
                    let result = serde_json::json!({
                        "path": evaluated.path,
                        "result": evaluated.result,
                        "reason": evaluated.reason,
                    });
                    self.record(&mut history, &mut outcome, current, &ctx, true, result)?;
                }

                NodeKind::ConversationStep {
                    name,
                    instructions,
                    objective,
                    max_attempts,
                    step_number,
                } => {
                    let first_run = !history.iter().any(|s| s.node_id == current.id);
                    let request = GenerateRequest {
                        conversation_id: ctx.conversation_id.clone(),
                        agent_id: ctx.agent_id,
                        lead_message: ctx.message.clone().unwrap_or_default(),
                        instructions: instructions.clone(),
                        objective: objective.clone(),
                        lead: ctx.lead.clone(),
                        step_number: *step_number,
                    };

                    if first_run {
                        // Opening message: hand it to the caller, then wait
                        // for the lead at this same node.
                        let reply = self.generator.generate(request).await?;
                        outcome.responses.push(GeneratedMessage {
                            node_id: current.id.clone(),
                            text: reply.text.clone(),
                        });
                        let result = serde_json::json!({
                            "step": name,
                            "response": reply.text,
                            "had_message": false,
                        });
                        self.record(&mut history, &mut outcome, current, &ctx, true, result)?;
                        self.pause_waiting(conversation_id, &current.id, &mut outcome)?;
                        break;
                    }

                    if ctx.message.is_none() {
                        // Nothing to evaluate yet; keep waiting.
                        self.pause_waiting(conversation_id, &current.id, &mut outcome)?;
                        break;
                    }

                    let attempts = history
                        .iter()
                        .filter(|s| {
                            s.node_id == current.id
                                && s.result
                                    .get("had_message")
                                    .and_then(|v| v.as_bool())
                                    .unwrap_or(false)
                        })
                        .count() as u32;
                    let limit = max_attempts.filter(|m| *m > 0).unwrap_or(UNLIMITED_ATTEMPTS);

                    let reply = self.generator.generate(request).await?;
                    if reply.objective_achieved {
                        // Objective reached: no reply of our own, just move
                        // down the success path.
                        branch_path = Some("success".into());
                        let result = serde_json::json!({
                            "step": name,
                            "had_message": true,
                            "objective_achieved": true,
                            "attempt": attempts + 1,
                        });
                        self.record(&mut history, &mut outcome, current, &ctx, true, result)?;
                    } else {
                        outcome.responses.push(GeneratedMessage {
                            node_id: current.id.clone(),
                            text: reply.text.clone(),
                        });
                        let exhausted = attempts + 1 >= limit;
                        let result = serde_json::json!({
                            "step": name,
                            "response": reply.text,
                            "had_message": true,
                            "objective_achieved": false,
                            "attempt": attempts + 1,
                            "max_attempts": limit,
                        });
                        self.record(&mut history, &mut outcome, current, &ctx, true, result)?;
                        if exhausted {
                            branch_path = Some("failure".into());
                        } else {
                            self.pause_waiting(conversation_id, &current.id, &mut outcome)?;
                            break;
                        }
                    }
                }

                NodeKind::Action { action } => {
                    // Replay guard: a redelivered job must not repeat an
                    // external side effect already recorded for this event.
                    if action.externally_effectful()
                        && let Some(prior) = history.iter().find(|s| {
                            s.node_id == current.id && s.event_key == ctx.event_key && s.success
                        })
                    {
                        tracing::info!(node = %current.id, "skipping replayed action");
                        branch_path = prior
                            .result
                            .get("path")
                            .and_then(|v| v.as_str())
                            .map(String::from);
                        outcome.executed_nodes.push(ExecutedNode {
                            node_id: current.id.clone(),
                            node_type: current.node_type(),
                            success: true,
                            result: serde_json::json!({"skipped": "already_executed"}),
                        });
                    } else {
                        let executed = match self.executor.execute(&current.id, action, &ctx).await
                        {
                            Ok(executed) => executed,
                            Err(err) => {
                                // Record the failure, abort the branch, keep
                                // state as-is so a retry resumes here.
                                let result = serde_json::json!({"error": err.to_string()});
                                self.record(
                                    &mut history,
                                    &mut outcome,
                                    current,
                                    &ctx,
                                    false,
                                    result,
                                )?;
                                return Err(err);
                            }
                        };

                        if let Some(message) =
                            executed.result.get("message").and_then(|v| v.as_str())
                            && executed.action_type == "send_message"
                        {
                            outcome.responses.push(GeneratedMessage {
                                node_id: current.id.clone(),
                                text: message.to_string(),
                            });
                        }

                        branch_path = executed.branch.clone();
                        self.record(
                            &mut history,
                            &mut outcome,
                            current,
                            &ctx,
                            true,
                            executed.result.clone(),
                        )?;

                        if executed.flags.pauses_workflow {
                            let delay_secs = executed.resume_delay_secs.unwrap_or(3600);
                            self.pause_for_timer(
                                conversation_id,
                                &graph,
                                current,
                                delay_secs,
                                is_test_mode,
                                &mut outcome,
                            )?;
                            break;
                        }
                        if executed.flags.ends_branch {
                            self.store
                                .complete_workflow(conversation_id, "branch_completed")?;
                            outcome.completed = true;
                            outcome.final_node_id = Some(current.id.clone());
                            break;
                        }
                    }
                }
            }

            match graph.next_node(&current.id, branch_path.as_deref()) {
                Some(next) => {
                    self.store.update_current_node(conversation_id, &next.id)?;
                    current = next;
                }
                None => {
                    tracing::debug!(node = %current.id, "no outgoing edge, branch ends");
                    outcome.final_node_id = Some(current.id.clone());
                    break;
                }
            }
        }

        if outcome.final_node_id.is_none() {
            outcome.final_node_id = Some(current.id.clone());
        }
        Ok(outcome)
    }

    /// Pause waiting for a lead reply at `node_id` (no timer).
    fn pause_waiting(
        &self,
        conversation_id: &str,
        node_id: &str,
        outcome: &mut ProcessOutcome,
    ) -> Result<()> {
        self.store
            .pause_workflow(conversation_id, None, "waiting_for_response", node_id, None)?;
        outcome.paused = true;
        outcome.final_node_id = Some(node_id.to_string());
        Ok(())
    }

    /// Pause behind a timed wait: resume at the node after the wait via a
    /// dedup-keyed resume job. A wait with no successor completes instead.
    fn pause_for_timer(
        &self,
        conversation_id: &str,
        graph: &WorkflowGraph,
        wait_node: &Node,
        delay_secs: i64,
        is_test_mode: bool,
        outcome: &mut ProcessOutcome,
    ) -> Result<()> {
        let Some(next) = graph.next_node(&wait_node.id, None) else {
            self.store
                .complete_workflow(conversation_id, "branch_completed")?;
            outcome.completed = true;
            outcome.final_node_id = Some(wait_node.id.clone());
            return Ok(());
        };

        let delay = Duration::seconds(delay_secs);
        let resume_at = Utc::now() + delay;
        let mut job_id = None;
        if !is_test_mode {
            let job = Job::resume(conversation_id, &next.id, delay);
            job_id = Some(job.id.clone());
            let enqueued = self.jobs.enqueue(&job)?;
            if !enqueued {
                tracing::debug!(job = %job.id, "resume job already queued");
            }
        }
        self.store.pause_workflow(
            conversation_id,
            Some(resume_at),
            "wait_action",
            &next.id,
            job_id.as_deref(),
        )?;
        outcome.paused = true;
        outcome.final_node_id = Some(wait_node.id.clone());
        tracing::info!(
            conversation_id,
            resume_node = %next.id,
            delay_secs,
            "workflow paused behind timer"
        );
        Ok(())
    }

    /// Append one step to the local history, the store, and the outcome.
    fn record(
        &self,
        history: &mut Vec<StepRecord>,
        outcome: &mut ProcessOutcome,
        node: &Node,
        ctx: &ExecutionContext,
        success: bool,
        result: serde_json::Value,
    ) -> Result<()> {
        let step = StepRecord {
            node_id: node.id.clone(),
            node_type: node.node_type().to_string(),
            event_key: ctx.event_key.clone(),
            executed_at: Utc::now(),
            success,
            result: result.clone(),
        };
        self.store.append_step(&ctx.conversation_id, &step)?;
        history.push(step);
        outcome.executed_nodes.push(ExecutedNode {
            node_id: node.id.clone(),
            node_type: node.node_type(),
            success,
            result,
        });
        Ok(())
    }

    fn build_context(
        &self,
        state: &WorkflowStateRecord,
        event: &EventType,
        payload: &EventPayload,
        is_test_mode: bool,
    ) -> Result<ExecutionContext> {
        let conversation = self
            .store
            .conversation(&state.conversation_id)?
            .ok_or_else(|| {
                OutflowError::StateInconsistency(format!(
                    "conversation {} has workflow state but no record",
                    state.conversation_id
                ))
            })?;
        let lead = self
            .store
            .lead(&conversation.lead_id)?
            .unwrap_or_else(|| outflow_core::types::LeadProfile {
                id: conversation.lead_id.clone(),
                ..Default::default()
            });
        let stats = self.store.conversation_stats(&state.conversation_id)?;

        Ok(ExecutionContext {
            conversation_id: state.conversation_id.clone(),
            account_id: conversation.account_id,
            agent_id: state.agent_id,
            campaign_id: conversation.campaign_id,
            lead,
            event_key: event.event_key(payload),
            event: event.clone(),
            message: payload.message.clone(),
            intent: payload.intent.clone(),
            sentiment: payload.sentiment.clone(),
            stats,
            variables: state.variables.clone(),
            is_test_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outflow_connect::{NoopMessenger, StaticGenerator};
    use outflow_core::types::LeadProfile;
    use outflow_db::{AgentRecord, ConversationRecord};

    const AGENT_ID: i64 = 7;
    const CONV: &str = "conv-1";

    fn setup(
        definition: serde_json::Value,
        generator: StaticGenerator,
    ) -> (Arc<Store>, Arc<JobStore>, Arc<NoopMessenger>, WorkflowEngine) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let jobs = Arc::new(JobStore::open_in_memory().unwrap());
        let messenger = Arc::new(NoopMessenger::new());

        store
            .upsert_agent(&AgentRecord {
                id: AGENT_ID,
                name: "SDR Bot".into(),
                workflow_enabled: true,
                workflow_definition: Some(definition),
                transfer_triggers: vec![],
                transfer_message: None,
                transfer_silent: false,
                notify_on_handoff: true,
                sector_id: None,
            })
            .unwrap();
        store
            .upsert_lead(
                "acc",
                &LeadProfile {
                    id: "lead-1".into(),
                    name: Some("Maria Souza".into()),
                    company: Some("Acme".into()),
                    profile_id: Some("profile-1".into()),
                    status: Some("accepted".into()),
                    ..LeadProfile::default()
                },
            )
            .unwrap();
        store
            .upsert_conversation(&ConversationRecord {
                id: CONV.into(),
                account_id: "acc".into(),
                agent_id: Some(AGENT_ID),
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

        let engine = WorkflowEngine::new(
            store.clone(),
            jobs.clone(),
            messenger.clone(),
            Arc::new(generator),
        );
        (store, jobs, messenger, engine)
    }

    fn invite_flow() -> serde_json::Value {
        serde_json::json!({
            "nodes": [
                {"id": "t1", "type": "trigger", "event": "invite_accepted"},
                {"id": "sm1", "type": "action", "action": "send_message",
                 "message": "Oi {{first_name}}, obrigado por conectar!"},
                {"id": "w1", "type": "action", "action": "wait", "value": 24, "unit": "hours"},
                {"id": "sm2", "type": "action", "action": "send_message",
                 "message": "Conseguiu ver minha mensagem?", "wait_for_response": false}
            ],
            "edges": [
                {"source": "t1", "target": "sm1"},
                {"source": "sm1", "target": "w1"},
                {"source": "w1", "target": "sm2"}
            ]
        })
    }

    #[tokio::test]
    async fn test_invite_accepted_sends_then_pauses_behind_wait() {
        let (store, jobs, messenger, engine) = setup(invite_flow(), StaticGenerator::new(""));
        engine
            .initialize_workflow(CONV, AGENT_ID, Some("invite_accepted"))
            .unwrap()
            .unwrap();

        let outcome = engine
            .process_event(CONV, EventType::InviteAccepted, EventPayload::default())
            .await
            .unwrap();

        assert!(outcome.processed);
        assert!(outcome.paused);
        let executed: Vec<&str> = outcome
            .executed_nodes
            .iter()
            .map(|n| n.node_id.as_str())
            .collect();
        assert_eq!(executed, vec!["t1", "sm1", "w1"]);

        // The greeting went out, template rendered.
        assert_eq!(messenger.sent_count(), 1);
        assert!(messenger.sent.lock().unwrap()[0].2.starts_with("Oi Maria"));

        // Paused with the resume point after the wait node.
        let state = store.workflow_state(CONV).unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Paused);
        assert_eq!(state.resume_node_id.as_deref(), Some("sm2"));
        assert_eq!(state.paused_reason.as_deref(), Some("wait_action"));

        // Resume job scheduled ~24h out.
        let delayed = jobs.delayed(Utc::now()).unwrap();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].node_id.as_deref(), Some("sm2"));
        assert!(delayed[0].run_at > Utc::now() + Duration::hours(23));
        assert!(delayed[0].run_at <= Utc::now() + Duration::hours(24));
    }

    #[tokio::test]
    async fn test_timer_resume_is_idempotent() {
        let (store, _jobs, messenger, engine) = setup(invite_flow(), StaticGenerator::new(""));
        engine
            .initialize_workflow(CONV, AGENT_ID, Some("invite_accepted"))
            .unwrap()
            .unwrap();
        engine
            .process_event(CONV, EventType::InviteAccepted, EventPayload::default())
            .await
            .unwrap();
        assert_eq!(messenger.sent_count(), 1);

        // First timer delivery resumes and sends the follow-up.
        let outcome = engine
            .process_event(
                CONV,
                EventType::TimerFired { node_id: "sm2".into() },
                EventPayload::default(),
            )
            .await
            .unwrap();
        assert!(outcome.processed);
        assert_eq!(messenger.sent_count(), 2);
        let state = store.workflow_state(CONV).unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Active);

        // Redelivered timer replays as a no-op: same event key, side effect
        // already recorded.
        let outcome = engine
            .process_event(
                CONV,
                EventType::TimerFired { node_id: "sm2".into() },
                EventPayload::default(),
            )
            .await
            .unwrap();
        assert!(outcome.processed);
        assert_eq!(messenger.sent_count(), 2);

        // A timer for a different node is stale.
        let outcome = engine
            .process_event(
                CONV,
                EventType::TimerFired { node_id: "w1".into() },
                EventPayload::default(),
            )
            .await
            .unwrap();
        assert!(!outcome.processed);
        assert_eq!(outcome.reason.as_deref(), Some("stale_resume"));
    }

    #[tokio::test]
    async fn test_reply_cancels_scheduled_wait() {
        let (_store, jobs, _messenger, engine) = setup(
            serde_json::json!({
                "nodes": [
                    {"id": "t1", "type": "trigger", "event": "invite_accepted"},
                    {"id": "s1", "type": "conversation_step", "name": "Abertura",
                     "objective": "qualificar"},
                    {"id": "w1", "type": "action", "action": "wait", "value": 1, "unit": "hours"}
                ],
                "edges": [
                    {"source": "t1", "target": "s1"},
                    {"source": "s1", "target": "w1", "label": "success"}
                ]
            }),
            StaticGenerator::achieving("Ótimo falar com você!"),
        );
        engine
            .initialize_workflow(CONV, AGENT_ID, Some("invite_accepted"))
            .unwrap()
            .unwrap();

        // Opening pass pauses at the step waiting for a reply.
        engine
            .process_event(CONV, EventType::InviteAccepted, EventPayload::default())
            .await
            .unwrap();
        // Plant a stray timer to prove the reply clears it.
        jobs.enqueue(&Job::resume(CONV, "w1", Duration::hours(1))).unwrap();

        engine
            .process_event(
                CONV,
                EventType::MessageReceived,
                EventPayload::message("tenho interesse", "m-1"),
            )
            .await
            .unwrap();
        // The stray timer was cancelled by the reply, and the wait node had
        // no successor, so nothing new was scheduled.
        assert!(jobs.delayed(Utc::now()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conversation_step_objective_achieved_closes_positive() {
        let (store, _jobs, _messenger, engine) = setup(
            serde_json::json!({
                "nodes": [
                    {"id": "t1", "type": "trigger", "event": "invite_accepted"},
                    {"id": "s1", "type": "conversation_step", "name": "Qualificação",
                     "objective": "confirmar interesse"},
                    {"id": "cp", "type": "action", "action": "close_positive"}
                ],
                "edges": [
                    {"source": "t1", "target": "s1"},
                    {"source": "s1", "target": "cp", "label": "success"}
                ]
            }),
            StaticGenerator::achieving("Perfeito!"),
        );
        engine
            .initialize_workflow(CONV, AGENT_ID, Some("invite_accepted"))
            .unwrap()
            .unwrap();

        // First pass: opening message, pause for the lead.
        let outcome = engine
            .process_event(CONV, EventType::InviteAccepted, EventPayload::default())
            .await
            .unwrap();
        assert!(outcome.paused);
        assert_eq!(outcome.responses.len(), 1);
        let state = store.workflow_state(CONV).unwrap().unwrap();
        assert_eq!(state.paused_reason.as_deref(), Some("waiting_for_response"));
        assert_eq!(state.resume_node_id.as_deref(), Some("s1"));

        // Reply achieves the objective: success path closes positive.
        let outcome = engine
            .process_event(
                CONV,
                EventType::MessageReceived,
                EventPayload::message("quero sim!", "m-1"),
            )
            .await
            .unwrap();
        assert!(outcome.completed);
        // Objective achieved: the engine stays quiet and lets the next
        // node speak.
        assert!(outcome.responses.is_empty());

        let state = store.workflow_state(CONV).unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        let lead = store.lead("lead-1").unwrap().unwrap();
        assert_eq!(lead.status.as_deref(), Some("qualified"));
    }

    #[tokio::test]
    async fn test_conversation_step_exhausts_attempts_to_failure_path() {
        let (store, _jobs, _messenger, engine) = setup(
            serde_json::json!({
                "nodes": [
                    {"id": "t1", "type": "trigger", "event": "invite_accepted"},
                    {"id": "s1", "type": "conversation_step", "name": "Qualificação",
                     "objective": "confirmar interesse", "max_attempts": 1},
                    {"id": "cn", "type": "action", "action": "close_negative"}
                ],
                "edges": [
                    {"source": "t1", "target": "s1"},
                    {"source": "s1", "target": "cn", "label": "failure"}
                ]
            }),
            StaticGenerator::new("Entendi, pode me contar mais?"),
        );
        engine
            .initialize_workflow(CONV, AGENT_ID, Some("invite_accepted"))
            .unwrap()
            .unwrap();

        engine
            .process_event(CONV, EventType::InviteAccepted, EventPayload::default())
            .await
            .unwrap();
        let outcome = engine
            .process_event(
                CONV,
                EventType::MessageReceived,
                EventPayload::message("não sei", "m-1"),
            )
            .await
            .unwrap();

        // Single attempt allowed, objective missed: failure edge.
        assert!(outcome.completed);
        let state = store.workflow_state(CONV).unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        let conv = store.conversation(CONV).unwrap().unwrap();
        assert_eq!(conv.close_reason.as_deref(), Some("negative"));
    }

    #[tokio::test]
    async fn test_condition_routes_by_keyword() {
        let (store, _jobs, _messenger, engine) = setup(
            serde_json::json!({
                "nodes": [
                    {"id": "t1", "type": "trigger", "event": "message_received"},
                    {"id": "c1", "type": "condition", "condition": "keyword",
                     "operator": "contains", "value": "preço"},
                    {"id": "tag", "type": "action", "action": "add_tag", "tags": ["pricing"]},
                    {"id": "cn", "type": "action", "action": "close_negative"}
                ],
                "edges": [
                    {"source": "t1", "target": "c1"},
                    {"source": "c1", "target": "tag", "label": "yes"},
                    {"source": "c1", "target": "cn", "label": "no"}
                ]
            }),
            StaticGenerator::new(""),
        );
        engine
            .initialize_workflow(CONV, AGENT_ID, Some("message_received"))
            .unwrap()
            .unwrap();

        engine
            .process_event(
                CONV,
                EventType::MessageReceived,
                EventPayload::message("Qual o preço?", "m-1"),
            )
            .await
            .unwrap();

        assert_eq!(store.tags("lead-1").unwrap(), vec!["pricing"]);
        // The no-branch never ran.
        let conv = store.conversation(CONV).unwrap().unwrap();
        assert_eq!(conv.status, "open");
    }

    #[tokio::test]
    async fn test_http_request_branches_in_dry_run() {
        let (_store, _jobs, messenger, engine) = setup(
            serde_json::json!({
                "nodes": [
                    {"id": "t1", "type": "trigger", "event": "message_received"},
                    {"id": "h1", "type": "action", "action": "http_request",
                     "url": "https://api.example.com/enrich",
                     "extract": [{"path": "status", "var": "varStatus"}]},
                    {"id": "tag", "type": "action", "action": "add_tag", "tags": ["enriched"]},
                    {"id": "cn", "type": "action", "action": "close_negative"}
                ],
                "edges": [
                    {"source": "t1", "target": "h1"},
                    {"source": "h1", "target": "tag", "label": "success"},
                    {"source": "h1", "target": "cn", "label": "error"}
                ]
            }),
            StaticGenerator::new(""),
        );
        engine
            .initialize_workflow(CONV, AGENT_ID, Some("message_received"))
            .unwrap()
            .unwrap();

        let outcome = engine
            .process_event_with_options(
                CONV,
                EventType::MessageReceived,
                EventPayload::message("oi", "m-1"),
                true,
            )
            .await
            .unwrap();

        // Dry run: simulated success path, nothing delivered externally.
        let executed: Vec<&str> = outcome
            .executed_nodes
            .iter()
            .map(|n| n.node_id.as_str())
            .collect();
        assert_eq!(executed, vec!["t1", "h1", "tag"]);
        assert_eq!(messenger.sent_count(), 0);
        assert!(
            outcome.executed_nodes[1].result["simulated"]
                .as_bool()
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_failed_send_records_step_and_propagates() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let jobs = Arc::new(JobStore::open_in_memory().unwrap());
        let messenger = Arc::new(NoopMessenger::failing());
        store
            .upsert_agent(&AgentRecord {
                id: AGENT_ID,
                name: "SDR Bot".into(),
                workflow_enabled: true,
                workflow_definition: Some(invite_flow()),
                transfer_triggers: vec![],
                transfer_message: None,
                transfer_silent: false,
                notify_on_handoff: true,
                sector_id: None,
            })
            .unwrap();
        store
            .upsert_lead(
                "acc",
                &LeadProfile {
                    id: "lead-1".into(),
                    profile_id: Some("profile-1".into()),
                    ..LeadProfile::default()
                },
            )
            .unwrap();
        store
            .upsert_conversation(&ConversationRecord {
                id: CONV.into(),
                account_id: "acc".into(),
                agent_id: Some(AGENT_ID),
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
        let engine = WorkflowEngine::new(
            store.clone(),
            jobs,
            messenger,
            Arc::new(StaticGenerator::new("")),
        );
        engine
            .initialize_workflow(CONV, AGENT_ID, Some("invite_accepted"))
            .unwrap()
            .unwrap();

        let err = engine
            .process_event(CONV, EventType::InviteAccepted, EventPayload::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        // The failure is in the history and the message row survives with
        // a send_failed marker.
        let state = store.workflow_state(CONV).unwrap().unwrap();
        let failed_step = state
            .step_history
            .iter()
            .find(|s| s.node_id == "sm1")
            .unwrap();
        assert!(!failed_step.success);
        let stats = store.conversation_stats(CONV).unwrap();
        assert_eq!(stats.ai_messages, 1);
    }

    #[tokio::test]
    async fn test_event_without_state_is_skipped() {
        let (_store, _jobs, _messenger, engine) = setup(invite_flow(), StaticGenerator::new(""));
        let outcome = engine
            .process_event("ghost", EventType::MessageReceived, EventPayload::default())
            .await
            .unwrap();
        assert!(!outcome.processed);
        assert_eq!(outcome.reason.as_deref(), Some("no_workflow_state"));
    }

    #[tokio::test]
    async fn test_exactly_one_state_row_per_conversation() {
        let (store, _jobs, _messenger, engine) = setup(invite_flow(), StaticGenerator::new(""));
        engine
            .initialize_workflow(CONV, AGENT_ID, Some("invite_accepted"))
            .unwrap()
            .unwrap();
        // Initializing again keeps the original row and cursor.
        let again = engine
            .initialize_workflow(CONV, AGENT_ID, Some("invite_accepted"))
            .unwrap()
            .unwrap();
        assert_eq!(again.current_node_id.as_deref(), Some("t1"));
        let state = store.workflow_state(CONV).unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Active);
    }
}
