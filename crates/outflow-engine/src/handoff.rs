//! Handoff from automation to humans: trigger-keyword escalation matching
//! and handoff execution.

use std::sync::Arc;

use outflow_core::error::{OutflowError, Result};
use outflow_core::traits::Messenger;
use outflow_db::{AgentRecord, Store};

use crate::rotation::RotationService;

/// One escalation trigger: taxonomy id plus its keyword list.
pub struct TriggerDefinition {
    pub id: &'static str,
    pub keywords: &'static [&'static str],
}

/// The fixed escalation taxonomy, in definition order. The first matching
/// trigger becomes the primary handoff reason.
pub const TRANSFER_TRIGGERS: &[TriggerDefinition] = &[
    TriggerDefinition {
        id: "doubt",
        keywords: &[
            "não entendi",
            "como funciona",
            "dúvida",
            "não sei",
            "pode explicar",
            "confuso",
            "complexo",
        ],
    },
    TriggerDefinition {
        id: "qualified",
        keywords: &[
            "interessado",
            "quero saber mais",
            "me conta mais",
            "parece bom",
            "gostei",
            "vamos conversar",
        ],
    },
    TriggerDefinition {
        id: "price",
        keywords: &[
            "preço",
            "quanto custa",
            "valor",
            "investimento",
            "custo",
            "orçamento",
            "budget",
            "pricing",
            "planos",
        ],
    },
    TriggerDefinition {
        id: "demo",
        keywords: &[
            "demo",
            "demonstração",
            "apresentação",
            "mostrar",
            "ver funcionando",
            "teste",
            "trial",
            "experimentar",
        ],
    },
    TriggerDefinition {
        id: "competitor",
        keywords: &[
            "concorrente",
            "outra empresa",
            "já uso",
            "comparar",
            "diferença entre",
            "vs",
            "versus",
        ],
    },
    TriggerDefinition {
        id: "urgency",
        keywords: &[
            "urgente",
            "preciso agora",
            "rápido",
            "prazo",
            "deadline",
            "imediato",
            "hoje",
            "amanhã",
        ],
    },
    TriggerDefinition {
        id: "frustration",
        keywords: &[
            "frustrado",
            "irritado",
            "problema",
            "não funciona",
            "péssimo",
            "horrível",
            "decepcionado",
            "cansado",
        ],
    },
];

/// Outcome of matching a message against an agent's enabled triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMatch {
    pub should_transfer: bool,
    pub matched_triggers: Vec<String>,
    /// `trigger_<id>` of the first match in taxonomy order, if any.
    pub reason: Option<String>,
}

/// Case-insensitive substring match of a message against the triggers the
/// agent enabled. Triggers are checked in taxonomy-definition order.
pub fn check_transfer_triggers(message: &str, agent: &AgentRecord) -> TriggerMatch {
    if agent.transfer_triggers.is_empty() || message.is_empty() {
        return TriggerMatch {
            should_transfer: false,
            matched_triggers: Vec::new(),
            reason: None,
        };
    }

    let message = message.to_lowercase();
    let mut matched = Vec::new();

    for definition in TRANSFER_TRIGGERS {
        if !agent.transfer_triggers.iter().any(|t| t == definition.id) {
            continue;
        }
        if definition
            .keywords
            .iter()
            .any(|keyword| message.contains(&keyword.to_lowercase()))
        {
            matched.push(definition.id.to_string());
        }
    }

    let reason = matched.first().map(|id| format!("trigger_{id}"));
    TriggerMatch {
        should_transfer: !matched.is_empty(),
        matched_triggers: matched,
        reason,
    }
}

/// Result of a handoff execution.
#[derive(Debug, Clone)]
pub struct HandoffResult {
    pub assignee_user_id: Option<i64>,
    pub assignee_name: Option<String>,
    pub message_sent: bool,
    pub notified: u32,
}

/// Executes the handoff: disables automation, selects an assignee (or fans
/// out to the sector), optionally sends a farewell, emits notifications.
pub struct HandoffService {
    store: Arc<Store>,
    rotation: RotationService,
    messenger: Arc<dyn Messenger>,
}

impl HandoffService {
    pub fn new(store: Arc<Store>, messenger: Arc<dyn Messenger>) -> Self {
        let rotation = RotationService::new(store.clone());
        Self {
            store,
            rotation,
            messenger,
        }
    }

    pub async fn execute_handoff(
        &self,
        conversation_id: &str,
        agent: &AgentRecord,
        reason: &str,
    ) -> Result<HandoffResult> {
        let conversation = self.store.conversation(conversation_id)?.ok_or_else(|| {
            OutflowError::StateInconsistency(format!("conversation {conversation_id} not found"))
        })?;

        tracing::info!(conversation_id, reason, "executing handoff");

        let assignee = self.rotation.assign_and_log(
            agent.id,
            &conversation.account_id,
            Some(conversation_id),
            Some(&conversation.lead_id),
        )?;

        self.store.disable_automation(
            conversation_id,
            reason,
            assignee.as_ref().map(|a| a.user_id),
        )?;

        // Farewell message, unless the agent hands off silently.
        let mut message_sent = false;
        if !agent.transfer_silent
            && let Some(farewell) = &agent.transfer_message
        {
            match self.send_farewell(&conversation.account_id, &conversation.lead_id, farewell, conversation_id).await {
                Ok(()) => message_sent = true,
                Err(e) => tracing::warn!("handoff farewell failed: {e}"),
            }
        }

        let mut notified = 0;
        if agent.notify_on_handoff {
            notified = self.notify(&conversation, agent, assignee.as_ref(), reason)?;
        }

        Ok(HandoffResult {
            assignee_user_id: assignee.as_ref().map(|a| a.user_id),
            assignee_name: assignee.map(|a| a.user_name),
            message_sent,
            notified,
        })
    }

    async fn send_farewell(
        &self,
        account_id: &str,
        lead_id: &str,
        farewell: &str,
        conversation_id: &str,
    ) -> Result<()> {
        let lead = self.store.lead(lead_id)?.ok_or_else(|| {
            OutflowError::StateInconsistency(format!("lead {lead_id} not found"))
        })?;
        let Some(profile_id) = lead.profile_id else {
            tracing::warn!(lead_id, "lead has no provider profile id, skipping farewell");
            return Ok(());
        };
        self.messenger
            .send_message(account_id, &profile_id, farewell)
            .await?;
        self.store
            .insert_message(conversation_id, "system", farewell, "sent")?;
        Ok(())
    }

    /// Notify the chosen assignee, or every active member of the agent's
    /// sector when no rotation is configured.
    fn notify(
        &self,
        conversation: &outflow_db::ConversationRecord,
        agent: &AgentRecord,
        assignee: Option<&crate::rotation::Assignee>,
        reason: &str,
    ) -> Result<u32> {
        let metadata = serde_json::json!({
            "reason": reason,
            "agent_name": agent.name,
            "exchange_count": conversation.exchange_count,
        });

        if let Some(assignee) = assignee {
            self.store.insert_notification(
                &conversation.account_id,
                Some(assignee.user_id),
                "handoff",
                "Nova conversa transferida",
                "Uma conversa foi transferida para você.",
                Some(&conversation.id),
                &metadata,
            )?;
            return Ok(1);
        }

        let Some(sector_id) = &agent.sector_id else {
            return Ok(0);
        };
        let users = self.store.active_sector_users(sector_id)?;
        for user in &users {
            self.store.insert_notification(
                &conversation.account_id,
                Some(user.id),
                "handoff",
                "Nova conversa transferida",
                "Uma conversa do seu setor precisa de atendimento humano.",
                Some(&conversation.id),
                &metadata,
            )?;
        }
        Ok(users.len() as u32)
    }
}
