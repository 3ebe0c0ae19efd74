use super::parse::parse_diagnosis;
use super::prompts::diagnosis_prompt;
use super::{Diagnosis, DiagnosisError, DiagnosisProvider, HttpTransport};
use crate::failure::FailureLog;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Google Generative Language API
const GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const PROVIDER: &str = "Gemini";

pub struct GeminiProvider {
    api_key: String,
    model: String,
    endpoint: String,
    transport: Arc<dyn HttpTransport>,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

impl GeminiProvider {
    pub fn new(api_key: String, model: String, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            api_key,
            model,
            endpoint: GEMINI_URL.to_string(),
            transport,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn url(&self) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.endpoint.trim_end_matches('/'),
            self.model,
            self.api_key
        )
    }
}

impl DiagnosisProvider for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    // Gemini honours response_mime_type, so its answer is parsed without fence stripping.
    fn diagnose(
        &self,
        log: &FailureLog,
        _model_hint: Option<&str>,
    ) -> Result<Diagnosis, DiagnosisError> {
        let body = json!({
            "contents": [
                { "parts": [ { "text": diagnosis_prompt(log) } ] }
            ],
            "generationConfig": {
                "response_mime_type": "application/json"
            }
        });

        info!(model = %self.model, "sending request to Gemini API");
        let reply = self
            .transport
            .post_json(&self.url(), &[], &body)
            .map_err(|e| DiagnosisError::from_transport(PROVIDER, e))?;

        if !reply.is_success() {
            return Err(DiagnosisError::Http {
                provider: PROVIDER,
                status: reply.status,
                body: reply.body,
            });
        }

        let parsed: GenerateContentResponse =
            serde_json::from_str(&reply.body).map_err(|e| DiagnosisError::Envelope {
                provider: PROVIDER,
                message: e.to_string(),
                body: reply.body.clone(),
            })?;

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or(DiagnosisError::EmptyResponse { provider: PROVIDER })?;

        parse_diagnosis(&text)
    }
}
