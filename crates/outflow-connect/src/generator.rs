//! Text-generation service client.

use async_trait::async_trait;

use outflow_core::config::GeneratorConfig;
use outflow_core::error::{OutflowError, Result};
use outflow_core::traits::TextGenerator;
use outflow_core::types::{GenerateRequest, GeneratedReply};

/// HTTP client for the generation service.
pub struct HttpGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
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
}

#[async_trait]
impl TextGenerator for HttpGenerator {
    async fn generate(&self, request: GenerateRequest) -> Result<GeneratedReply> {
        let url = format!("{}/api/v1/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| OutflowError::ExternalService(format!("generate: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OutflowError::ExternalService(format!(
                "generate: {status}: {body}"
            )));
        }

        response
            .json::<GeneratedReply>()
            .await
            .map_err(|e| OutflowError::ExternalService(format!("generate: bad response: {e}")))
    }
}

/// Returns a canned reply. Used in tests and dry runs.
pub struct StaticGenerator {
    pub text: String,
    pub objective_achieved: bool,
}

impl StaticGenerator {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            objective_achieved: false,
        }
    }

    pub fn achieving(text: &str) -> Self {
        Self {
            text: text.to_string(),
            objective_achieved: true,
        }
    }
}

#[async_trait]
impl TextGenerator for StaticGenerator {
    async fn generate(&self, _request: GenerateRequest) -> Result<GeneratedReply> {
        Ok(GeneratedReply {
            text: self.text.clone(),
            objective_achieved: self.objective_achieved,
            intent: None,
            sentiment: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outflow_core::types::LeadProfile;

    #[tokio::test]
    async fn test_static_generator() {
        let generator = StaticGenerator::achieving("Perfeito, vamos agendar!");
        let reply = generator
            .generate(GenerateRequest {
                conversation_id: "c1".into(),
                agent_id: 1,
                lead_message: "quero saber mais".into(),
                instructions: String::new(),
                objective: String::new(),
                lead: LeadProfile::default(),
                step_number: 0,
            })
            .await
            .unwrap();
        assert!(reply.objective_achieved);
        assert_eq!(reply.text, "Perfeito, vamos agendar!");
    }
}
