//! SMTP mailer for queued workflow emails (async lettre).

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use outflow_core::config::EmailConfig;
use outflow_core::error::{OutflowError, Result};

/// Sends workflow emails over SMTP. Construction fails fast on a bad
/// relay host; individual sends fail retryably.
pub struct Mailer {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from_address: String,
}

impl Mailer {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self {
                transport: None,
                from_address: config.from_address.clone(),
            });
        }
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            .map_err(|e| OutflowError::Config(format!("smtp relay: {e}")))?
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();
        Ok(Self {
            transport: Some(transport),
            from_address: config.from_address.clone(),
        })
    }

    pub fn enabled(&self) -> bool {
        self.transport.is_some()
    }

    /// Send one HTML email. A disabled mailer drops the send with a warning
    /// instead of failing the surrounding job forever.
    pub async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<()> {
        let Some(transport) = &self.transport else {
            tracing::warn!(to, subject, "mailer disabled, dropping email");
            return Ok(());
        };

        let message = Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|e| OutflowError::Config(format!("from address: {e}")))?,
            )
            .to(to
                .parse()
                .map_err(|e| OutflowError::Validation(format!("recipient address: {e}")))?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html_body.to_string())
            .map_err(|e| OutflowError::Validation(format!("build email: {e}")))?;

        transport
            .send(message)
            .await
            .map_err(|e| OutflowError::ExternalService(format!("smtp send: {e}")))?;

        tracing::info!(to, subject, "email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_mailer_drops_quietly() {
        let mailer = Mailer::new(&EmailConfig::default()).unwrap();
        assert!(!mailer.enabled());
        mailer.send("a@b.com", "hi", "<p>hi</p>").await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_recipient_is_validation_error() {
        let config = EmailConfig {
            enabled: true,
            smtp_host: "smtp.example.com".into(),
            from_address: "noreply@example.com".into(),
            ..EmailConfig::default()
        };
        let mailer = Mailer::new(&config).unwrap();
        let err = mailer.send("not-an-address", "hi", "x").await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
