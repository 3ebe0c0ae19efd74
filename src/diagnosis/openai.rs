use super::parse::{parse_diagnosis, strip_markdown_fences};
use super::prompts::diagnosis_prompt;
use super::{Diagnosis, DiagnosisError, DiagnosisProvider, HttpTransport};
use crate::failure::FailureLog;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const OPENAI_URL: &str = "https://api.openai.com/v1";
const PROVIDER: &str = "OpenAI";

pub struct OpenAiProvider {
    api_key: String,
    model: String,
    endpoint: String,
    transport: Arc<dyn HttpTransport>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// POST one chat-completions request in JSON mode and return the answer text.
///
/// Shared by every backend that speaks the OpenAI chat-completions dialect.
pub(super) fn chat_completion(
    transport: &dyn HttpTransport,
    provider: &'static str,
    url: &str,
    headers: &[(&str, String)],
    model: &str,
    prompt: String,
) -> Result<String, DiagnosisError> {
    let request = ChatRequest {
        model,
        messages: vec![Message {
            role: "user".to_string(),
            content: prompt,
        }],
        response_format: ResponseFormat {
            format_type: "json_object",
        },
    };
    let body = serde_json::to_value(&request).map_err(|e| DiagnosisError::Transport {
        provider,
        message: format!("failed to encode request: {}", e),
    })?;

    info!(model, "sending request to {} API", provider);
    let reply = transport
        .post_json(url, headers, &body)
        .map_err(|e| DiagnosisError::from_transport(provider, e))?;

    if !reply.is_success() {
        return Err(DiagnosisError::Http {
            provider,
            status: reply.status,
            body: reply.body,
        });
    }

    let parsed: ChatResponse =
        serde_json::from_str(&reply.body).map_err(|e| DiagnosisError::Envelope {
            provider,
            message: e.to_string(),
            body: reply.body.clone(),
        })?;

    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or(DiagnosisError::EmptyResponse { provider })
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: String, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            api_key,
            model,
            endpoint: OPENAI_URL.to_string(),
            transport,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

impl DiagnosisProvider for OpenAiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn diagnose(
        &self,
        log: &FailureLog,
        _model_hint: Option<&str>,
    ) -> Result<Diagnosis, DiagnosisError> {
        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let headers = [("Authorization", format!("Bearer {}", self.api_key))];
        let text = chat_completion(
            self.transport.as_ref(),
            PROVIDER,
            &url,
            &headers,
            &self.model,
            diagnosis_prompt(log),
        )?;

        // JSON mode still occasionally comes back inside a code fence.
        parse_diagnosis(strip_markdown_fences(&text))
    }
}
