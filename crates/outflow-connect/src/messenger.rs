//! Messaging API client — direct messages, connection requests, withdrawals.

use async_trait::async_trait;
use std::sync::Mutex;

use outflow_core::config::MessagingConfig;
use outflow_core::error::{OutflowError, Result};
use outflow_core::traits::Messenger;

/// HTTP client for the provider's messaging API.
pub struct HttpMessenger {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpMessenger {
    pub fn new(config: &MessagingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("Outflow/0.3")
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| OutflowError::ExternalService(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn check(&self, response: reqwest::Response, what: &str) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(OutflowError::Permanent(format!("{what}: {status}: {body}")));
        }
        Err(OutflowError::ExternalService(format!(
            "{what}: {status}: {body}"
        )))
    }
}

#[async_trait]
impl Messenger for HttpMessenger {
    async fn send_message(&self, account_id: &str, recipient_id: &str, text: &str) -> Result<()> {
        let url = format!("{}/api/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .json(&serde_json::json!({
                "account_id": account_id,
                "recipient_id": recipient_id,
                "text": text,
            }))
            .send()
            .await
            .map_err(|e| OutflowError::ExternalService(format!("send message: {e}")))?;
        self.check(response, "send message").await
    }

    async fn send_connection_request(
        &self,
        account_id: &str,
        profile_id: &str,
        note: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/api/v1/users/{}/invitation", self.base_url, profile_id);
        let mut body = serde_json::json!({ "account_id": account_id });
        if let Some(note) = note {
            body["message"] = serde_json::Value::String(note.to_string());
        }
        let response = self
            .client
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| OutflowError::ExternalService(format!("send invitation: {e}")))?;
        self.check(response, "send invitation").await
    }

    async fn withdraw_invitation(&self, account_id: &str, profile_id: &str) -> Result<()> {
        let url = format!("{}/api/v1/users/{}/invitation", self.base_url, profile_id);
        let response = self
            .client
            .delete(&url)
            .header("X-API-KEY", &self.api_key)
            .query(&[("account_id", account_id)])
            .send()
            .await
            .map_err(|e| OutflowError::ExternalService(format!("withdraw invitation: {e}")))?;
        self.check(response, "withdraw invitation").await
    }
}

/// Records sends instead of performing them. Used in tests and dry runs.
#[derive(Default)]
pub struct NoopMessenger {
    /// (account_id, recipient/profile id, text) per call, in order.
    pub sent: Mutex<Vec<(String, String, String)>>,
    pub withdrawn: Mutex<Vec<(String, String)>>,
    /// When set, every call fails with an ExternalService error.
    pub fail: bool,
}

impl NoopMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Messenger for NoopMessenger {
    async fn send_message(&self, account_id: &str, recipient_id: &str, text: &str) -> Result<()> {
        if self.fail {
            return Err(OutflowError::ExternalService("messenger unavailable".into()));
        }
        self.sent
            .lock()
            .map_err(|e| OutflowError::ExternalService(e.to_string()))?
            .push((account_id.into(), recipient_id.into(), text.into()));
        Ok(())
    }

    async fn send_connection_request(
        &self,
        account_id: &str,
        profile_id: &str,
        note: Option<&str>,
    ) -> Result<()> {
        if self.fail {
            return Err(OutflowError::ExternalService("messenger unavailable".into()));
        }
        self.sent
            .lock()
            .map_err(|e| OutflowError::ExternalService(e.to_string()))?
            .push((
                account_id.into(),
                profile_id.into(),
                note.unwrap_or_default().into(),
            ));
        Ok(())
    }

    async fn withdraw_invitation(&self, account_id: &str, profile_id: &str) -> Result<()> {
        if self.fail {
            return Err(OutflowError::ExternalService("messenger unavailable".into()));
        }
        self.withdrawn
            .lock()
            .map_err(|e| OutflowError::ExternalService(e.to_string()))?
            .push((account_id.into(), profile_id.into()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_records_sends() {
        let messenger = NoopMessenger::new();
        messenger.send_message("acc", "lead", "oi").await.unwrap();
        messenger
            .send_connection_request("acc", "profile", Some("note"))
            .await
            .unwrap();
        assert_eq!(messenger.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_failing_noop_is_retryable() {
        let messenger = NoopMessenger::failing();
        let err = messenger.send_message("acc", "lead", "oi").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
