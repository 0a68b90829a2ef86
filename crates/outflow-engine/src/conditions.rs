//! Condition evaluation — routes condition nodes to `yes`/`no`.

use chrono::{Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use outflow_core::types::ExecutionContext;

/// Comparison operators for condition values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
}

impl Default for Operator {
    fn default() -> Self {
        Operator::Equals
    }
}

/// A condition over the execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum ConditionSpec {
    // Boolean conditions — no operator needed.
    InviteAccepted,
    InviteIgnored,
    IsConnected,
    ResponseReceived,
    HasResponded,
    HasEmail,
    HasPhone,
    IsQualified,
    IsBusinessHours {
        #[serde(default)]
        hours: Option<BusinessHours>,
    },

    // Comparison conditions — operator + value.
    Sentiment {
        #[serde(default)]
        operator: Operator,
        value: String,
    },
    Keyword {
        #[serde(default = "default_contains")]
        operator: Operator,
        value: String,
    },
    Intent {
        #[serde(default)]
        operator: Operator,
        value: String,
    },
    /// Seconds since the last message.
    TimeElapsed {
        #[serde(default)]
        operator: Operator,
        value: i64,
    },
    MessageCount {
        #[serde(default)]
        operator: Operator,
        value: u32,
    },
    ExchangeCount {
        #[serde(default)]
        operator: Operator,
        value: u32,
    },
    LeadStatus {
        #[serde(default)]
        operator: Operator,
        value: String,
    },
    /// Dot path into workflow variables; truthiness when no value given.
    Custom {
        path: String,
        #[serde(default)]
        operator: Option<Operator>,
        #[serde(default)]
        value: Option<String>,
    },
}

fn default_contains() -> Operator {
    Operator::Contains
}

/// Business-hours window checked against UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessHours {
    #[serde(default = "default_start")]
    pub start_hour: u32,
    #[serde(default = "default_end")]
    pub end_hour: u32,
    /// 0 = Sunday … 6 = Saturday. Empty means every day.
    #[serde(default)]
    pub days: Vec<u32>,
}

fn default_start() -> u32 {
    9
}
fn default_end() -> u32 {
    18
}

/// The evaluated outcome: a branch path plus the explanation logged with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionOutcome {
    pub path: &'static str,
    pub result: bool,
    pub reason: String,
}

impl ConditionOutcome {
    fn new(result: bool, reason: String) -> Self {
        Self {
            path: if result { "yes" } else { "no" },
            result,
            reason,
        }
    }
}

impl ConditionSpec {
    /// Evaluate against the context. Never fails: unknown/missing data
    /// evaluates to `no` with the reason recorded.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> ConditionOutcome {
        match self {
            ConditionSpec::InviteAccepted => {
                let hit = ctx.event.name() == "invite_accepted";
                ConditionOutcome::new(hit, format!("event = {}", ctx.event.name()))
            }
            ConditionSpec::InviteIgnored => {
                let name = ctx.event.name();
                let hit = name == "invite_ignored" || name == "no_response";
                ConditionOutcome::new(hit, format!("event = {name}"))
            }
            ConditionSpec::IsConnected => {
                let hit = ctx.lead.status.as_deref() == Some("connected")
                    || ctx.lead.status.as_deref() == Some("accepted");
                ConditionOutcome::new(hit, format!("lead status = {:?}", ctx.lead.status))
            }
            ConditionSpec::ResponseReceived => {
                let hit = ctx.event.name() == "message_received" && ctx.message.is_some();
                ConditionOutcome::new(hit, "inbound message present".into())
            }
            ConditionSpec::HasResponded => {
                let n = ctx.stats.lead_messages;
                ConditionOutcome::new(n > 0, format!("lead sent {n} message(s)"))
            }
            ConditionSpec::HasEmail => {
                ConditionOutcome::new(ctx.lead.email.is_some(), "email availability".into())
            }
            ConditionSpec::HasPhone => {
                ConditionOutcome::new(ctx.lead.phone.is_some(), "phone availability".into())
            }
            ConditionSpec::IsQualified => {
                let qualified = matches!(
                    ctx.lead.status.as_deref(),
                    Some("qualified") | Some("engaged") | Some("ready_to_buy")
                );
                ConditionOutcome::new(qualified, format!("lead status = {:?}", ctx.lead.status))
            }
            ConditionSpec::IsBusinessHours { hours } => {
                let hit = in_business_hours(hours.as_ref(), Utc::now());
                ConditionOutcome::new(hit, "business hours window".into())
            }
            ConditionSpec::Sentiment { operator, value } => {
                let actual = ctx.sentiment.clone().unwrap_or_default();
                let hit = compare_strings(&actual, *operator, value);
                ConditionOutcome::new(hit, format!("sentiment {actual:?} vs {value:?}"))
            }
            ConditionSpec::Keyword { operator, value } => {
                let message = ctx.message.clone().unwrap_or_default().to_lowercase();
                let keyword = value.to_lowercase();
                if message.is_empty() || keyword.is_empty() {
                    return ConditionOutcome::new(false, "empty message or keyword".into());
                }
                let hit = match operator {
                    Operator::NotContains => !message.contains(&keyword),
                    Operator::Equals => message == keyword,
                    Operator::NotEquals => message != keyword,
                    _ => message.contains(&keyword),
                };
                ConditionOutcome::new(hit, format!("message vs keyword {value:?}"))
            }
            ConditionSpec::Intent { operator, value } => {
                let actual = ctx.intent.clone().unwrap_or_default();
                let hit = compare_strings(&actual, *operator, value);
                ConditionOutcome::new(hit, format!("intent {actual:?} vs {value:?}"))
            }
            ConditionSpec::TimeElapsed { operator, value } => {
                let Some(last) = ctx.stats.last_message_at else {
                    return ConditionOutcome::new(false, "no prior message".into());
                };
                let elapsed = (Utc::now() - last).num_seconds();
                let hit = compare_numbers(elapsed as f64, *operator, *value as f64);
                ConditionOutcome::new(hit, format!("elapsed {elapsed}s vs {value}s"))
            }
            ConditionSpec::MessageCount { operator, value } => {
                let actual = ctx.stats.total_messages;
                let hit = compare_numbers(actual as f64, *operator, *value as f64);
                ConditionOutcome::new(hit, format!("messages {actual} vs {value}"))
            }
            ConditionSpec::ExchangeCount { operator, value } => {
                let actual = ctx.stats.exchange_count;
                let hit = compare_numbers(actual as f64, *operator, *value as f64);
                ConditionOutcome::new(hit, format!("exchanges {actual} vs {value}"))
            }
            ConditionSpec::LeadStatus { operator, value } => {
                let actual = ctx.lead.status.clone().unwrap_or_default();
                let hit = compare_strings(&actual, *operator, value);
                ConditionOutcome::new(hit, format!("lead status {actual:?} vs {value:?}"))
            }
            ConditionSpec::Custom {
                path,
                operator,
                value,
            } => {
                let root = serde_json::to_value(&ctx.variables).unwrap_or_default();
                let found = outflow_core::template::extract_json_path(&root, path);
                match (operator, value) {
                    (Some(op), Some(expected)) => {
                        let actual = found
                            .map(|v| match v {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .unwrap_or_default();
                        let hit = compare_strings(&actual, *op, expected);
                        ConditionOutcome::new(hit, format!("{path} = {actual:?} vs {expected:?}"))
                    }
                    _ => {
                        let truthy = matches!(
                            found,
                            Some(serde_json::Value::Bool(true))
                                | Some(serde_json::Value::Number(_))
                                | Some(serde_json::Value::String(_))
                                | Some(serde_json::Value::Object(_))
                                | Some(serde_json::Value::Array(_))
                        ) && found != Some(&serde_json::Value::String(String::new()));
                        ConditionOutcome::new(truthy, format!("{path} truthiness"))
                    }
                }
            }
        }
    }
}

fn compare_strings(actual: &str, operator: Operator, expected: &str) -> bool {
    let a = actual.to_lowercase();
    let e = expected.to_lowercase();
    match operator {
        Operator::Equals => a == e,
        Operator::NotEquals => a != e,
        Operator::Contains => a.contains(&e),
        Operator::NotContains => !a.contains(&e),
        // Ordering operators over strings fall back to equality.
        _ => a == e,
    }
}

fn compare_numbers(actual: f64, operator: Operator, expected: f64) -> bool {
    match operator {
        Operator::Equals => actual == expected,
        Operator::NotEquals => actual != expected,
        Operator::GreaterThan => actual > expected,
        Operator::LessThan => actual < expected,
        Operator::GreaterOrEqual => actual >= expected,
        Operator::LessOrEqual => actual <= expected,
        Operator::Contains | Operator::NotContains => actual == expected,
    }
}

fn in_business_hours(hours: Option<&BusinessHours>, now: chrono::DateTime<Utc>) -> bool {
    let Some(hours) = hours else {
        return true; // not configured: always open
    };
    let hour = now.hour();
    let in_window = hour >= hours.start_hour && hour < hours.end_hour;
    let day = now.weekday().num_days_from_sunday();
    let day_active = hours.days.is_empty() || hours.days.contains(&day);
    in_window && day_active
}

#[cfg(test)]
mod tests {
    use super::*;
    use outflow_core::types::{ConversationStats, EventType, LeadProfile};
    use std::collections::HashMap;

    fn ctx(event: EventType, message: Option<&str>) -> ExecutionContext {
        ExecutionContext {
            conversation_id: "c1".into(),
            account_id: "acc".into(),
            agent_id: 1,
            campaign_id: None,
            lead: LeadProfile {
                id: "lead-1".into(),
                email: Some("a@b.com".into()),
                status: Some("accepted".into()),
                ..LeadProfile::default()
            },
            event_key: event.event_key(&Default::default()),
            event,
            message: message.map(String::from),
            intent: None,
            sentiment: None,
            stats: ConversationStats {
                lead_messages: 2,
                ai_messages: 3,
                total_messages: 5,
                exchange_count: 2,
                last_message_at: Some(Utc::now() - chrono::Duration::minutes(10)),
            },
            variables: HashMap::new(),
            is_test_mode: false,
        }
    }

    #[test]
    fn test_invite_accepted_condition() {
        let spec = ConditionSpec::InviteAccepted;
        assert_eq!(spec.evaluate(&ctx(EventType::InviteAccepted, None)).path, "yes");
        assert_eq!(spec.evaluate(&ctx(EventType::MessageReceived, None)).path, "no");
    }

    #[test]
    fn test_keyword_contains() {
        let spec = ConditionSpec::Keyword {
            operator: Operator::Contains,
            value: "preço".into(),
        };
        let outcome = spec.evaluate(&ctx(EventType::MessageReceived, Some("Qual o preço do plano?")));
        assert!(outcome.result);

        let outcome = spec.evaluate(&ctx(EventType::MessageReceived, Some("bom dia")));
        assert!(!outcome.result);
    }

    #[test]
    fn test_exchange_count_threshold() {
        let spec = ConditionSpec::ExchangeCount {
            operator: Operator::GreaterOrEqual,
            value: 2,
        };
        assert!(spec.evaluate(&ctx(EventType::MessageReceived, None)).result);

        let spec = ConditionSpec::ExchangeCount {
            operator: Operator::GreaterThan,
            value: 5,
        };
        assert!(!spec.evaluate(&ctx(EventType::MessageReceived, None)).result);
    }

    #[test]
    fn test_time_elapsed() {
        let spec = ConditionSpec::TimeElapsed {
            operator: Operator::GreaterThan,
            value: 60,
        };
        // Last message was 10 minutes ago.
        assert!(spec.evaluate(&ctx(EventType::NoResponse, None)).result);
    }

    #[test]
    fn test_custom_variable_truthiness() {
        let mut c = ctx(EventType::MessageReceived, None);
        c.variables
            .insert("varStatus".into(), serde_json::json!("ok"));
        let spec = ConditionSpec::Custom {
            path: "varStatus".into(),
            operator: None,
            value: None,
        };
        assert!(spec.evaluate(&c).result);

        let spec = ConditionSpec::Custom {
            path: "missing".into(),
            operator: None,
            value: None,
        };
        assert!(!spec.evaluate(&c).result);
    }

    #[test]
    fn test_condition_deserializes_from_node_json() {
        let spec: ConditionSpec = serde_json::from_value(serde_json::json!({
            "condition": "keyword",
            "operator": "contains",
            "value": "demo"
        }))
        .unwrap();
        let outcome = spec.evaluate(&ctx(EventType::MessageReceived, Some("quero uma demo")));
        assert!(outcome.result);
    }
}
