//! # Outflow Connect
//!
//! Thin clients for the external collaborators: the messaging /
//! connection-request API, the text-generation service, and SMTP mail.
//! Each has an inert stand-in for tests and dry runs.

pub mod generator;
pub mod mailer;
pub mod messenger;

pub use generator::{HttpGenerator, StaticGenerator};
pub use mailer::Mailer;
pub use messenger::{HttpMessenger, NoopMessenger};
