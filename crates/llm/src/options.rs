use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_TOKENS: u64 = 2048;
pub const DEFAULT_API_TYPE: &str = "openai";
pub const DEFAULT_AZURE_API_VERSION: &str = "2023-05-15";

/// Wire dialect selected by the `api_type` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiDialect {
    OpenAi,
    Azure,
    AzureAd,
    CloudflareAzure,
    Anthropic,
    Gemini,
    Perplexity,
}

impl ApiDialect {
    /// Case-insensitive; blank selects OpenAI.
    pub fn parse(api_type: &str) -> Option<Self> {
        match api_type.trim().to_ascii_lowercase().as_str() {
            "" | "openai" | "open_ai" => Some(Self::OpenAi),
            "azure" => Some(Self::Azure),
            "azure_ad" => Some(Self::AzureAd),
            "cloudflare_azure" => Some(Self::CloudflareAzure),
            "anthropic" => Some(Self::Anthropic),
            "google" | "gemini" | "google-gemini" => Some(Self::Gemini),
            "perplexity" => Some(Self::Perplexity),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Azure => "azure",
            Self::AzureAd => "azure_ad",
            Self::CloudflareAzure => "cloudflare_azure",
            Self::Anthropic => "anthropic",
            Self::Gemini => "google-gemini",
            Self::Perplexity => "perplexity",
        }
    }

    pub fn is_azure(self) -> bool {
        matches!(self, Self::Azure | Self::AzureAd | Self::CloudflareAzure)
    }

    /// Hosted dialects that cannot fall back to an unauthenticated local endpoint.
    pub fn requires_api_token(self) -> bool {
        !matches!(self, Self::OpenAi)
    }
}

/// Feature switches a backend advertises for one resolved model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default = "enabled")]
    pub streaming: bool,
    #[serde(default = "enabled")]
    pub system_prompt: bool,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            system_prompt: true,
        }
    }
}

/// Fully resolved backend options for one completion call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOptions {
    pub model: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_api_type")]
    pub api_type: String,
    /// Azure REST api version; blank uses [`DEFAULT_AZURE_API_VERSION`].
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            endpoint: String::new(),
            api_token: String::new(),
            api_type: default_api_type(),
            api_version: String::new(),
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            timeout_ms: None,
            capabilities: ModelCapabilities::default(),
        }
    }
}

impl ModelOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into().trim().to_string(),
            ..Self::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim().to_string();
        self
    }

    pub fn with_api_token(mut self, api_token: impl Into<String>) -> Self {
        self.api_token = api_token.into().trim().to_string();
        self
    }

    pub fn with_api_type(mut self, api_type: impl Into<String>) -> Self {
        self.api_type = api_type.into().trim().to_string();
        self
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into().trim().to_string();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Zero and absent both mean "no deadline".
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis)
    }

    pub fn dialect(&self) -> Option<ApiDialect> {
        ApiDialect::parse(&self.api_type)
    }

    pub fn azure_api_version(&self) -> &str {
        if self.api_version.trim().is_empty() {
            DEFAULT_AZURE_API_VERSION
        } else {
            self.api_version.trim()
        }
    }

    /// Azure deployment names cannot contain `.` or `:`.
    pub fn azure_deployment(&self) -> String {
        self.model.replace(['.', ':'], "")
    }
}

/// Lookup key handed to an [`OptionsResolver`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionContext {
    pub session_id: String,
    pub preset: Option<String>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            preset: None,
        }
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        let preset = preset.into();
        self.preset = if preset.trim().is_empty() {
            None
        } else {
            Some(preset.trim().to_string())
        };
        self
    }
}

/// Resolves model options for a session. Implementations must be side-effect free.
pub trait OptionsResolver: Send + Sync {
    fn resolve(&self, context: &SessionContext) -> ModelOptions;
}

/// Resolver that hands out one fixed record regardless of context.
#[derive(Debug, Clone, Default)]
pub struct StaticOptionsResolver {
    options: ModelOptions,
}

impl StaticOptionsResolver {
    pub fn new(options: ModelOptions) -> Self {
        Self { options }
    }
}

impl OptionsResolver for StaticOptionsResolver {
    fn resolve(&self, _context: &SessionContext) -> ModelOptions {
        self.options.clone()
    }
}

fn enabled() -> bool {
    true
}

fn default_api_type() -> String {
    DEFAULT_API_TYPE.to_string()
}
