//! # Outflow Engine
//!
//! The workflow automation core: a per-conversation state machine that
//! executes a directed graph of trigger/condition/action nodes across
//! asynchronous events and durable delayed jobs.
//!
//! ## Architecture
//! ```text
//! event (webhook / fired timer)
//!   → WorkflowEngine.process_event
//!     → load persisted state (resume rules for paused conversations)
//!     → walk the graph
//!         trigger    — gates entry
//!         condition  — picks a yes/no edge
//!         step       — generates a message (returned, not delivered)
//!         action     — ActionExecutor (send, tag, close, HTTP, wait, …)
//!     → on a pausing node: persist resume point, enqueue a resume job
//!     → on escalation: RotationService picks the human
//! ```

pub mod actions;
pub mod conditions;
pub mod engine;
pub mod graph;
pub mod handoff;
pub mod limits;
pub mod rotation;
pub mod sweep;

pub use actions::{ActionExecutionResult, ActionExecutor, ActionFlags, ActionSpec};
pub use conditions::{ConditionOutcome, ConditionSpec, Operator};
pub use engine::{ExecutedNode, GeneratedMessage, ProcessOutcome, WorkflowEngine};
pub use graph::{Edge, Node, NodeKind, WorkflowGraph};
pub use handoff::{HandoffResult, HandoffService, TriggerMatch, check_transfer_triggers};
pub use limits::{InviteAllowance, InviteLimiter, WindowUsage, tier_limits};
pub use rotation::{Assignee, RotationService};
pub use sweep::{InviteSweeper, SweepStats, random_send_times};
