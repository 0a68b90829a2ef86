//! Domain types shared across the engine, scheduler, and store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An event that can drive a conversation's workflow forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    /// The lead accepted the connection request.
    InviteAccepted,
    /// The connection request aged out without a reaction.
    InviteIgnored,
    /// The lead sent a message.
    MessageReceived,
    /// A follow-up window elapsed without a reply.
    NoResponse,
    /// A scheduled wait elapsed; carries the resume-node snapshot taken
    /// when the pause was persisted.
    TimerFired { node_id: String },
    /// Manual (re)start from the console or API layer.
    Manual,
}

impl EventType {
    /// Event name as stored in trigger definitions and logs.
    pub fn name(&self) -> &'static str {
        match self {
            EventType::InviteAccepted => "invite_accepted",
            EventType::InviteIgnored => "invite_ignored",
            EventType::MessageReceived => "message_received",
            EventType::NoResponse => "no_response",
            EventType::TimerFired { .. } => "timer_fired",
            EventType::Manual => "manual",
        }
    }

    /// Stable identity of one logical delivery of this event. Step history
    /// records it so a redelivered job replays as a no-op instead of
    /// re-running side effects.
    pub fn event_key(&self, payload: &EventPayload) -> String {
        match self {
            EventType::TimerFired { node_id } => format!("resume:{node_id}"),
            EventType::MessageReceived => match &payload.message_id {
                Some(id) => format!("msg:{id}"),
                None => "msg:unkeyed".into(),
            },
            other => other.name().to_string(),
        }
    }
}

/// Payload accompanying an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventPayload {
    /// Inbound message text, when the event carries one.
    #[serde(default)]
    pub message: Option<String>,
    /// Provider message id, used for replay deduplication.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Intent detected upstream, if any.
    #[serde(default)]
    pub intent: Option<String>,
    /// Sentiment detected upstream, if any.
    #[serde(default)]
    pub sentiment: Option<String>,
}

impl EventPayload {
    pub fn message(text: &str, message_id: &str) -> Self {
        Self {
            message: Some(text.to_string()),
            message_id: Some(message_id.to_string()),
            ..Self::default()
        }
    }
}

/// Lead identity and profile data available to conditions and templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadProfile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Provider-side profile id used for connection requests.
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub sector_id: Option<String>,
}

/// Message counters for a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationStats {
    pub lead_messages: u32,
    pub ai_messages: u32,
    pub total_messages: u32,
    pub exchange_count: u32,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Typed execution context threaded through node execution.
///
/// Required fields are always populated by the engine; optional fields
/// depend on what the conversation has linked (campaign, opportunity).
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub conversation_id: String,
    pub account_id: String,
    pub agent_id: i64,
    pub campaign_id: Option<String>,
    pub lead: LeadProfile,
    pub event: EventType,
    /// Identity of this logical event delivery (see [`EventType::event_key`]).
    pub event_key: String,
    /// Inbound message for message-class events.
    pub message: Option<String>,
    pub intent: Option<String>,
    pub sentiment: Option<String>,
    pub stats: ConversationStats,
    /// Workflow variables, including values extracted by `http_request`.
    pub variables: HashMap<String, serde_json::Value>,
    /// Dry-run flag: executors simulate and perform no external calls or
    /// persistence.
    pub is_test_mode: bool,
}

impl ExecutionContext {
    /// Flat string variables for template substitution: lead fields plus
    /// stringified workflow variables.
    pub fn template_vars(&self) -> HashMap<String, String> {
        let mut vars = crate::template::lead_vars(&self.lead);
        for (k, v) in &self.variables {
            let s = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            vars.insert(k.clone(), s);
        }
        vars
    }
}

/// Request to the text-generation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub conversation_id: String,
    pub agent_id: i64,
    /// The lead's latest message, empty for an opening message.
    #[serde(default)]
    pub lead_message: String,
    /// Step-level instructions merged with the step objective.
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub objective: String,
    pub lead: LeadProfile,
    #[serde(default)]
    pub step_number: u32,
}

/// Reply from the text-generation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedReply {
    pub text: String,
    /// Whether the step's objective was judged achieved by this exchange.
    #[serde(default)]
    pub objective_achieved: bool,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_keys() {
        let timer = EventType::TimerFired { node_id: "n7".into() };
        assert_eq!(timer.event_key(&EventPayload::default()), "resume:n7");

        let msg = EventType::MessageReceived;
        let payload = EventPayload::message("oi", "m-123");
        assert_eq!(msg.event_key(&payload), "msg:m-123");

        // Same timer delivered twice yields the same key.
        let again = EventType::TimerFired { node_id: "n7".into() };
        assert_eq!(
            timer.event_key(&EventPayload::default()),
            again.event_key(&EventPayload::default())
        );
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let e = EventType::TimerFired { node_id: "node-2".into() };
        let json = serde_json::to_string(&e).unwrap();
        let back: EventType = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }
}
