use bevy::prelude::*;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-4";

/// endpoint + credentials for the chat-completion provider.
///
/// `Debug` redacts the api key.
#[derive(Resource, Clone, Default, PartialEq, Eq)]
pub struct DiveConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl std::fmt::Debug for DiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiveConfig")
            .field("api_key", &if self.api_key.is_empty() { "<empty>" } else { "<redacted>" })
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl DiveConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// seed from `OPENAI_API_KEY`, `LLM_BASE_URL` and `LLM_MODEL`.
    ///
    /// on wasm there is no process environment; the key has to be supplied by the page.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            api_key: lookup("OPENAI_API_KEY").unwrap_or_default(),
            base_url: non_empty("LLM_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: non_empty("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn model_or_default(&self) -> &str {
        if self.model.trim().is_empty() { DEFAULT_MODEL } else { &self.model }
    }

    pub fn chat_completions_url(&self) -> String {
        let base = if self.base_url.trim().is_empty() { DEFAULT_BASE_URL } else { &self.base_url };
        format!("{}/chat/completions", normalize_base_url(base))
    }
}

/// openai-compatible providers want the `/v1` prefix; users paste it both ways.
pub fn normalize_base_url(base: &str) -> String {
    let b = base.trim().trim_end_matches('/');
    if b.ends_with("/v1") {
        b.to_string()
    } else {
        format!("{}/v1", b)
    }
}
