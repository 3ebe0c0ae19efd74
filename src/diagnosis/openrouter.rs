use super::openai::chat_completion;
use super::parse::{parse_diagnosis, strip_markdown_fences};
use super::prompts::diagnosis_prompt;
use super::{Diagnosis, DiagnosisError, DiagnosisProvider, HttpTransport};
use crate::failure::FailureLog;
use std::sync::Arc;

/// OpenRouter direct API URL (BYOK mode)
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";
const PROVIDER: &str = "OpenRouter";

/// Any model routed through OpenRouter, addressed as `vendor/model`.
pub struct OpenRouterProvider {
    api_key: String,
    model: String,
    endpoint: String,
    transport: Arc<dyn HttpTransport>,
}

impl OpenRouterProvider {
    pub fn new(api_key: String, model: String, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            api_key,
            model,
            endpoint: OPENROUTER_URL.to_string(),
            transport,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

impl DiagnosisProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn diagnose(
        &self,
        log: &FailureLog,
        _model_hint: Option<&str>,
    ) -> Result<Diagnosis, DiagnosisError> {
        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let headers = [
            ("Authorization", format!("Bearer {}", self.api_key)),
            ("X-Title", "ai-harness".to_string()),
        ];
        let text = chat_completion(
            self.transport.as_ref(),
            PROVIDER,
            &url,
            &headers,
            &self.model,
            diagnosis_prompt(log),
        )?;

        // Routed models differ in how strictly they follow JSON mode.
        parse_diagnosis(strip_markdown_fences(&text))
    }
}
