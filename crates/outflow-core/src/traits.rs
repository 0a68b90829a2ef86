//! Collaborator traits — the seams to the outside world.
//!
//! Delivery transport and text generation are external systems (spec'd as
//! black boxes); the engine only ever talks to these traits so tests and
//! dry runs can swap in inert implementations.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{GenerateRequest, GeneratedReply};

/// Outbound messaging / connection-request API.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a direct message to an already-connected lead.
    async fn send_message(&self, account_id: &str, recipient_id: &str, text: &str) -> Result<()>;

    /// Send a connection request, optionally with a personalized note.
    async fn send_connection_request(
        &self,
        account_id: &str,
        profile_id: &str,
        note: Option<&str>,
    ) -> Result<()>;

    /// Withdraw a pending connection request.
    async fn withdraw_invitation(&self, account_id: &str, profile_id: &str) -> Result<()>;
}

/// AI text-generation service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<GeneratedReply>;
}
