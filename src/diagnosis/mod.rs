//! Failure diagnosis through a language-model backend
//!
//! A [`DiagnosisProvider`] turns a [`FailureLog`] into a [`Diagnosis`]: a matcher regex
//! for the failure class plus the remedial actions that should fix it. One provider
//! exists per backend (Gemini, OpenAI, OpenRouter); [`ConfiguredProvider`] picks one from
//! the configured credentials at call time.
//!
//! Providers make exactly one request per call and never retry. Whether to ask again is
//! the caller's decision.

pub mod backend;
pub mod client;
pub mod gemini;
pub mod openai;
pub mod openrouter;
pub mod parse;
pub mod prompts;

pub use backend::{select_backend, Backend, Selection};
pub use client::{HttpReply, HttpTransport, ReqwestTransport, TransportError};
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use openrouter::OpenRouterProvider;
pub use parse::parse_diagnosis;

use crate::config::Credentials;
use crate::failure::FailureLog;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// One unit of installation work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemedialAction {
    /// Handed to the install command as `<manager> <name>`.
    Package { manager: String, name: String },
    /// Run verbatim through the shell.
    Shell { command: String },
}

impl fmt::Display for RemedialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemedialAction::Package { manager, name } => write!(f, "{} ({})", name, manager),
            RemedialAction::Shell { command } => write!(f, "`{}`", command),
        }
    }
}

/// What a backend concluded about a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    /// Regex meant to recognise this failure class in future logs.
    pub matcher: String,
    /// Strings the matcher must match.
    pub positive_examples: Vec<String>,
    /// Strings the matcher must not match.
    pub negative_examples: Vec<String>,
    /// In execution order. Empty means the backend had no actionable fix.
    pub remedies: Vec<RemedialAction>,
}

#[derive(Debug, Error)]
pub enum DiagnosisError {
    #[error(
        "no API key found; set one of {}, {} or {}",
        crate::config::GEMINI_API_KEY_VAR,
        crate::config::OPENAI_API_KEY_VAR,
        crate::config::OPENROUTER_API_KEY_VAR
    )]
    NoCredentials,
    #[error("{provider} request timed out after {}s", .timeout.as_secs())]
    Timeout {
        provider: &'static str,
        timeout: Duration,
    },
    #[error("failed to send request to {provider}: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} API request failed with status {status}: {body}")]
    Http {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("failed to decode {provider} response: {message}\n{body}")]
    Envelope {
        provider: &'static str,
        message: String,
        body: String,
    },
    #[error("no response from {provider}")]
    EmptyResponse { provider: &'static str },
    #[error("failed to parse JSON from LLM: {message}\nResponse: {response}")]
    Parse { message: String, response: String },
}

impl DiagnosisError {
    pub(crate) fn from_transport(provider: &'static str, err: TransportError) -> Self {
        match err {
            TransportError::Timeout(timeout) => DiagnosisError::Timeout { provider, timeout },
            TransportError::Request(message) => DiagnosisError::Transport { provider, message },
        }
    }
}

/// Submit a failure log, get a diagnosis back.
pub trait DiagnosisProvider {
    /// Human-readable backend name for banners and logs.
    fn name(&self) -> &str;

    /// `model_hint` overrides the backend's default model when it belongs to that backend.
    fn diagnose(
        &self,
        log: &FailureLog,
        model_hint: Option<&str>,
    ) -> Result<Diagnosis, DiagnosisError>;
}

impl<P: DiagnosisProvider + ?Sized> DiagnosisProvider for &P {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn diagnose(
        &self,
        log: &FailureLog,
        model_hint: Option<&str>,
    ) -> Result<Diagnosis, DiagnosisError> {
        (**self).diagnose(log, model_hint)
    }
}

impl<P: DiagnosisProvider + ?Sized> DiagnosisProvider for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn diagnose(
        &self,
        log: &FailureLog,
        model_hint: Option<&str>,
    ) -> Result<Diagnosis, DiagnosisError> {
        (**self).diagnose(log, model_hint)
    }
}

/// Picks a backend from the credentials each time it is asked for a diagnosis.
///
/// Selection is deferred to [`diagnose`](DiagnosisProvider::diagnose) so a run whose
/// first attempt succeeds never needs credentials at all.
pub struct ConfiguredProvider {
    credentials: Credentials,
    transport: Arc<dyn HttpTransport>,
}

impl ConfiguredProvider {
    pub fn new(credentials: Credentials, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            credentials,
            transport,
        }
    }

    /// Build the concrete provider for the current credentials and hint.
    pub fn resolve(
        &self,
        model_hint: Option<&str>,
    ) -> Result<Box<dyn DiagnosisProvider>, DiagnosisError> {
        let selection = select_backend(&self.credentials, model_hint)?;
        info!(
            backend = selection.backend.label(),
            model = %selection.model,
            "selected diagnosis backend"
        );
        Ok(selection.into_provider(Arc::clone(&self.transport)))
    }
}

impl DiagnosisProvider for ConfiguredProvider {
    fn name(&self) -> &str {
        "configured backend"
    }

    fn diagnose(
        &self,
        log: &FailureLog,
        model_hint: Option<&str>,
    ) -> Result<Diagnosis, DiagnosisError> {
        let provider = self.resolve(model_hint)?;
        provider.diagnose(log, model_hint)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_no_credentials_fails_before_any_request() {
        let transport = StubTransport::replying(200, "{}");
        let provider = ConfiguredProvider::new(Credentials::default(), transport.clone());

        let err = provider
            .diagnose(&FailureLog::from_text("boom"), None)
            .unwrap_err();

        assert!(matches!(err, DiagnosisError::NoCredentials));
        assert!(err.to_string().contains("no API key found"));
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn test_configured_provider_delegates_to_selected_backend() {
        let answer = r#"{"matcher":"x","test_ok":[],"test_fail":[],"packages":[]}"#;
        let envelope = serde_json::json!({
            "choices": [{"message": {"content": answer}}]
        });
        let transport = StubTransport::replying(200, &envelope.to_string());
        let credentials = Credentials {
            openai_api_key: Some("sk-test".to_string()),
            ..Credentials::default()
        };
        let provider = ConfiguredProvider::new(credentials, transport.clone());

        let diagnosis = provider
            .diagnose(&FailureLog::from_text("boom"), None)
            .unwrap();

        assert_eq!(diagnosis.matcher, "x");
        assert_eq!(transport.request_count(), 1);
        assert!(transport.last_request().url.ends_with("/chat/completions"));
    }

    #[test]
    fn test_remedial_action_display() {
        assert_eq!(package("pip", "foo").to_string(), "foo (pip)");
        let shell = RemedialAction::Shell {
            command: "apt-get install -y libfoo".to_string(),
        };
        assert_eq!(shell.to_string(), "`apt-get install -y libfoo`");
    }
}
