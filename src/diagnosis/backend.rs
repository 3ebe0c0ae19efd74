//! Backend selection
//!
//! A pure function of the configured credentials and the optional model hint. No
//! provider code runs and nothing touches the network until a backend is chosen.

use super::{
    DiagnosisError, DiagnosisProvider, GeminiProvider, HttpTransport, OpenAiProvider,
    OpenRouterProvider,
};
use crate::config::Credentials;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Gemini,
    OpenAi,
    OpenRouter,
}

impl Backend {
    /// Order tried when the model hint doesn't settle it.
    pub const PRIORITY: [Backend; 3] = [Backend::Gemini, Backend::OpenAi, Backend::OpenRouter];

    pub fn label(&self) -> &'static str {
        match self {
            Backend::Gemini => "Gemini",
            Backend::OpenAi => "OpenAI",
            Backend::OpenRouter => "OpenRouter",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Backend::Gemini => "gemini-2.5-flash",
            Backend::OpenAi => "gpt-4o",
            Backend::OpenRouter => "openai/gpt-4o-mini",
        }
    }

    pub fn api_key<'a>(&self, credentials: &'a Credentials) -> Option<&'a str> {
        match self {
            Backend::Gemini => credentials.gemini_api_key.as_deref(),
            Backend::OpenAi => credentials.openai_api_key.as_deref(),
            Backend::OpenRouter => credentials.openrouter_api_key.as_deref(),
        }
    }

    /// The backend a model id belongs to, judged by its naming scheme.
    pub fn for_model(model: &str) -> Option<Backend> {
        let model = model.trim().to_ascii_lowercase();
        if model.contains('/') {
            Some(Backend::OpenRouter)
        } else if model.starts_with("gemini") {
            Some(Backend::Gemini)
        } else if model.starts_with("gpt-")
            || ["o1", "o3", "o4"].iter().any(|p| model.starts_with(p))
        {
            Some(Backend::OpenAi)
        } else {
            None
        }
    }
}

/// A chosen backend with everything needed to call it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub backend: Backend,
    pub api_key: String,
    pub model: String,
}

impl Selection {
    pub fn into_provider(self, transport: Arc<dyn HttpTransport>) -> Box<dyn DiagnosisProvider> {
        match self.backend {
            Backend::Gemini => Box::new(GeminiProvider::new(self.api_key, self.model, transport)),
            Backend::OpenAi => Box::new(OpenAiProvider::new(self.api_key, self.model, transport)),
            Backend::OpenRouter => {
                Box::new(OpenRouterProvider::new(self.api_key, self.model, transport))
            }
        }
    }
}

/// Choose a backend.
///
/// A hint that names a backend family wins when that backend has a key, and becomes the
/// model id. Otherwise the first backend in [`Backend::PRIORITY`] with a key is used with
/// its default model; a hint is never sent to a backend it doesn't belong to.
pub fn select_backend(
    credentials: &Credentials,
    model_hint: Option<&str>,
) -> Result<Selection, DiagnosisError> {
    let hint = model_hint.map(str::trim).filter(|h| !h.is_empty());
    let hinted_backend = hint.and_then(Backend::for_model);

    if let (Some(hint), Some(backend)) = (hint, hinted_backend) {
        if let Some(key) = backend.api_key(credentials) {
            return Ok(Selection {
                backend,
                api_key: key.to_string(),
                model: hint.to_string(),
            });
        }
    }

    let backend = Backend::PRIORITY
        .into_iter()
        .find(|b| b.api_key(credentials).is_some())
        .ok_or(DiagnosisError::NoCredentials)?;
    let api_key = backend
        .api_key(credentials)
        .ok_or(DiagnosisError::NoCredentials)?
        .to_string();

    Ok(Selection {
        backend,
        api_key,
        model: backend.default_model().to_string(),
    })
}
