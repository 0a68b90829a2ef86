//! # Outflow Core
//!
//! Shared foundation for the Outflow workflow automation engine:
//! error taxonomy, configuration, domain types, collaborator traits,
//! and message template processing.

pub mod config;
pub mod error;
pub mod template;
pub mod traits;
pub mod types;

pub use config::OutflowConfig;
pub use error::{OutflowError, Result};
pub use traits::{Messenger, TextGenerator};
pub use types::{
    ConversationStats, EventPayload, EventType, ExecutionContext, GenerateRequest,
    GeneratedReply, LeadProfile,
};
