use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tern_llm::{
    DEFAULT_API_TYPE, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, ModelOptions, OptionsResolver,
    SessionContext,
};
use tern_session::DEFAULT_HISTORY_WINDOW;
use tern_storage::SessionId;

pub const SETTINGS_DIRECTORY_NAME: &str = "tern";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const HISTORY_DIRECTORY_NAME: &str = "history";
pub const SQLITE_FILE_NAME: &str = "history.sqlite";

/// Top-level model section. Blank fields are filled from the environment at resolve time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_api_type")]
    pub api_type: String,
    /// Only read by the Azure dialects.
    #[serde(default)]
    pub api_version: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_name: String::new(),
            api_key: String::new(),
            endpoint: String::new(),
            api_type: default_api_type(),
            api_version: String::new(),
            max_tokens: default_max_tokens(),
            timeout_ms: None,
        }
    }
}

impl ModelSettings {
    fn normalized(mut self) -> Self {
        self.model_name = self.model_name.trim().to_string();
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = self.endpoint.trim().to_string();
        self.api_version = self.api_version.trim().to_string();
        self.api_type = if self.api_type.trim().is_empty() {
            default_api_type()
        } else {
            self.api_type.trim().to_string()
        };
        self
    }

    fn overlay(mut self, preset: &PresetSettings) -> Self {
        if let Some(model_name) = non_blank(preset.model_name.as_deref()) {
            self.model_name = model_name;
        }
        if let Some(api_key) = non_blank(preset.api_key.as_deref()) {
            self.api_key = api_key;
        }
        if let Some(endpoint) = non_blank(preset.endpoint.as_deref()) {
            self.endpoint = endpoint;
        }
        if let Some(api_type) = non_blank(preset.api_type.as_deref()) {
            self.api_type = api_type;
        }
        if let Some(api_version) = non_blank(preset.api_version.as_deref()) {
            self.api_version = api_version;
        }
        if preset.max_tokens.is_some() {
            self.max_tokens = preset.max_tokens;
        }
        if preset.timeout_ms.is_some() {
            self.timeout_ms = preset.timeout_ms;
        }
        self
    }
}

/// Named override of the model section; unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<bool>,
    /// `false` switches the preset to one-shot completions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    #[default]
    Json,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub presets: BTreeMap<String, PresetSettings>,
    #[serde(default)]
    pub active_preset: Option<String>,
    #[serde(default)]
    pub preamble: Option<String>,
    #[serde(default)]
    pub history_backend: HistoryBackend,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default)]
    pub history_dir: Option<PathBuf>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: ModelSettings::default(),
            presets: BTreeMap::new(),
            active_preset: None,
            preamble: None,
            history_backend: HistoryBackend::default(),
            history_window: default_history_window(),
            history_dir: None,
            session_id: None,
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.model = self.model.normalized();
        self.presets = self
            .presets
            .into_iter()
            .filter_map(|(name, preset)| {
                let name = name.trim().to_string();
                (!name.is_empty()).then_some((name, preset))
            })
            .collect();
        self.active_preset = non_blank(self.active_preset.as_deref());
        self.preamble = non_blank(self.preamble.as_deref());
        self.session_id = non_blank(self.session_id.as_deref());
        if self.history_window == 0 {
            self.history_window = default_history_window();
        }
        self
    }

    /// Directory holding per-session history, defaulting under the platform data dir.
    pub fn history_root(&self) -> PathBuf {
        self.history_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".tern"))
                .join(HISTORY_DIRECTORY_NAME)
        })
    }

    /// Resolves the model options for `preset`, falling back to the active preset.
    pub fn model_options(&self, preset: Option<&str>, env: &EnvOverrides) -> ModelOptions {
        let preset_name = preset.or(self.active_preset.as_deref());
        let preset = preset_name.and_then(|name| {
            let found = self.presets.get(name);
            if found.is_none() {
                tracing::warn!(preset = name, "unknown preset; using model section");
            }
            found
        });

        let model = match preset {
            Some(preset) => self.model.clone().overlay(preset),
            None => self.model.clone(),
        };

        let model_name = non_blank(Some(model.model_name.as_str()))
            .or_else(|| env.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let api_key = non_blank(Some(model.api_key.as_str()))
            .or_else(|| env.api_key.clone())
            .unwrap_or_default();
        let endpoint = non_blank(Some(model.endpoint.as_str()))
            .or_else(|| env.base_url.clone())
            .unwrap_or_default();

        let mut options = ModelOptions::new(model_name)
            .with_api_token(api_key)
            .with_endpoint(endpoint)
            .with_api_type(model.api_type)
            .with_api_version(model.api_version);
        options.max_tokens = model.max_tokens;
        options.timeout_ms = model.timeout_ms;
        if let Some(system_prompt) = preset.and_then(|preset| preset.system_prompt) {
            options.capabilities.system_prompt = system_prompt;
        }
        if let Some(streaming) = preset.and_then(|preset| preset.streaming) {
            options.capabilities.streaming = streaming;
        }
        options
    }
}

/// `OPENAI_*` variables captured once at startup. Never written back to the settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            api_key: non_blank(lookup("OPENAI_API_KEY").as_deref()),
            model: non_blank(lookup("OPENAI_MODEL").as_deref()),
            base_url: non_blank(lookup("OPENAI_BASE_URL").as_deref()),
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
    env: EnvOverrides,
    // Set while the file on disk failed to parse; it must not be overwritten implicitly.
    unreadable: AtomicBool,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".tern"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf, env: EnvOverrides) -> Self {
        let (settings, unreadable) = match Self::load_from_disk(&config_path) {
            Ok(settings) => (settings, false),
            Err(error) => {
                tracing::warn!(
                    path = %config_path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                (Settings::default(), true)
            }
        };
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
            env,
            unreadable: AtomicBool::new(unreadable),
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path(), EnvOverrides::from_env())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    /// True when the settings file exists but could not be parsed.
    pub fn is_unreadable(&self) -> bool {
        self.unreadable.load(Ordering::SeqCst)
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        self.unreadable.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Re-reads the file and swaps the result in atomically.
    ///
    /// A file that fails to parse leaves the current settings in place and returns false.
    pub fn reload(&self) -> bool {
        match Self::load_from_disk(&self.config_path) {
            Ok(settings) => {
                self.settings.store(Arc::new(settings));
                self.unreadable.store(false, Ordering::SeqCst);
                true
            }
            Err(error) => {
                tracing::warn!(
                    path = %self.config_path.display(),
                    error = %error,
                    "failed to parse settings, keeping current values"
                );
                self.unreadable.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    /// Returns the configured session id, minting and saving one on first run.
    pub fn ensure_session_id(&self) -> Result<SessionId, SettingsError> {
        let settings = self.settings();
        if let Some(raw) = settings.session_id.as_deref() {
            match SessionId::parse(raw) {
                Ok(session_id) => return Ok(session_id),
                Err(error) => {
                    tracing::warn!(error = %error, "configured session id is invalid; minting a new one");
                }
            }
        }

        let session_id = SessionId::new_v7();
        let mut updated = (*settings).clone();
        updated.session_id = Some(session_id.to_string());

        if self.is_unreadable() {
            tracing::warn!(
                path = %self.config_path.display(),
                session_id = %session_id,
                "settings file is unreadable; session id kept for this run only"
            );
            self.settings.store(Arc::new(updated.normalized()));
            return Ok(session_id);
        }

        self.update(updated)?;
        Ok(session_id)
    }

    fn load_from_disk(path: &Path) -> Result<Settings, figment::Error> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
            return Ok(Settings::default());
        }

        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .extract::<Settings>()
            .map(Settings::normalized)
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

impl OptionsResolver for SettingsStore {
    fn resolve(&self, context: &SessionContext) -> ModelOptions {
        self.settings()
            .model_options(context.preset.as_deref(), &self.env)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn default_api_type() -> String {
    DEFAULT_API_TYPE.to_string()
}

fn default_max_tokens() -> Option<u64> {
    Some(DEFAULT_MAX_TOKENS)
}

fn default_history_window() -> usize {
    DEFAULT_HISTORY_WINDOW
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path, content: Option<&str>, env: EnvOverrides) -> SettingsStore {
        let path = dir.join(SETTINGS_FILE_NAME);
        if let Some(content) = content {
            std::fs::write(&path, content).unwrap();
        }
        SettingsStore::new(path, env)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), None, EnvOverrides::default());

        let settings = store.settings();
        assert_eq!(*settings, Settings::default());
        assert_eq!(settings.history_window, 30);

        let options = store.resolve(&SessionContext::new("s"));
        assert_eq!(options.model, DEFAULT_MODEL);
        assert_eq!(options.max_tokens, Some(DEFAULT_MAX_TOKENS));
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(
            dir.path(),
            Some(r#"{ "model": { "model_name": " gpt-4o " }, "history_backend": "sqlite" }"#),
            EnvOverrides::default(),
        );

        let settings = store.settings();
        assert_eq!(settings.model.model_name, "gpt-4o");
        assert_eq!(settings.model.api_type, DEFAULT_API_TYPE);
        assert_eq!(settings.history_backend, HistoryBackend::Sqlite);
        assert_eq!(settings.history_window, DEFAULT_HISTORY_WINDOW);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some("{ not json"), EnvOverrides::default());
        assert_eq!(*store.settings(), Settings::default());
        assert!(store.is_unreadable());
    }

    #[test]
    fn malformed_file_survives_startup_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let written = r#"{ "model": { "api_key": "sk-user", "model_name": "o3", }, "presets": { "fast": {} } }"#;
        let store = store_in(dir.path(), Some(written), EnvOverrides::default());

        let first = store.ensure_session_id().unwrap();
        assert_eq!(store.ensure_session_id().unwrap(), first);

        let after = std::fs::read_to_string(store.config_path()).unwrap();
        assert_eq!(after, written);
        assert!(!store.config_path().with_extension("json.tmp").exists());
    }

    #[test]
    fn reload_keeps_current_settings_when_file_breaks() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(
            dir.path(),
            Some(r#"{ "model": { "model_name": "o3" } }"#),
            EnvOverrides::default(),
        );
        let session_id = store.ensure_session_id().unwrap();

        std::fs::write(store.config_path(), "{ broken").unwrap();
        assert!(!store.reload());
        assert!(store.is_unreadable());
        assert_eq!(store.settings().model.model_name, "o3");
        assert_eq!(store.ensure_session_id().unwrap(), session_id);
        assert_eq!(
            std::fs::read_to_string(store.config_path()).unwrap(),
            "{ broken"
        );

        std::fs::write(store.config_path(), r#"{ "model": { "model_name": "o4-mini" } }"#).unwrap();
        assert!(store.reload());
        assert!(!store.is_unreadable());
        assert_eq!(store.settings().model.model_name, "o4-mini");
    }

    #[test]
    fn environment_fills_only_blank_fields() {
        let env = EnvOverrides::from_lookup(|key| match key {
            "OPENAI_API_KEY" => Some("sk-env".to_string()),
            "OPENAI_MODEL" => Some("env-model".to_string()),
            "OPENAI_BASE_URL" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(env.base_url, None);

        let settings = Settings {
            model: ModelSettings {
                model_name: "file-model".to_string(),
                ..ModelSettings::default()
            },
            ..Settings::default()
        };
        let options = settings.model_options(None, &env);
        assert_eq!(options.model, "file-model");
        assert_eq!(options.api_token, "sk-env");
        assert_eq!(options.endpoint, "");

        let options = Settings::default().model_options(None, &env);
        assert_eq!(options.model, "env-model");
    }

    #[test]
    fn preset_overrides_model_section() {
        let mut settings = Settings::default();
        settings.model.api_key = "sk-base".to_string();
        settings.model.endpoint = "http://localhost:11434/v1".to_string();
        settings.presets.insert(
            "fast".to_string(),
            PresetSettings {
                model_name: Some("llama3".to_string()),
                timeout_ms: Some(5_000),
                system_prompt: Some(false),
                streaming: Some(false),
                ..PresetSettings::default()
            },
        );

        let options = settings.model_options(Some("fast"), &EnvOverrides::default());
        assert_eq!(options.model, "llama3");
        assert_eq!(options.api_token, "sk-base");
        assert_eq!(options.endpoint, "http://localhost:11434/v1");
        assert_eq!(options.timeout_ms, Some(5_000));
        assert!(!options.capabilities.system_prompt);
        assert!(!options.capabilities.streaming);

        let options = settings.model_options(Some("missing"), &EnvOverrides::default());
        assert_eq!(options.model, DEFAULT_MODEL);
    }

    #[test]
    fn azure_preset_carries_api_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(
            dir.path(),
            Some(
                r#"{
                    "model": { "api_key": "sk-base" },
                    "presets": {
                        "azure": {
                            "api_type": "azure",
                            "endpoint": "https://tern.openai.azure.com",
                            "api_version": "2024-06-01"
                        }
                    }
                }"#,
            ),
            EnvOverrides::default(),
        );

        let options = store.resolve(&SessionContext::new("s").with_preset("azure"));
        assert_eq!(options.api_type, "azure");
        assert_eq!(options.api_version, "2024-06-01");
        assert_eq!(options.endpoint, "https://tern.openai.azure.com");
        assert_eq!(options.api_token, "sk-base");

        let options = store.resolve(&SessionContext::new("s"));
        assert_eq!(options.azure_api_version(), tern_llm::DEFAULT_AZURE_API_VERSION);
    }

    #[test]
    fn active_preset_applies_when_context_names_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(
            dir.path(),
            Some(
                r#"{
                    "active_preset": "big",
                    "presets": { "big": { "model_name": "gpt-4.1" }, "small": { "model_name": "gpt-4.1-nano" } }
                }"#,
            ),
            EnvOverrides::default(),
        );

        assert_eq!(store.resolve(&SessionContext::new("s")).model, "gpt-4.1");
        assert_eq!(
            store
                .resolve(&SessionContext::new("s").with_preset("small"))
                .model,
            "gpt-4.1-nano"
        );
    }

    #[test]
    fn update_persists_and_swaps() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), None, EnvOverrides::default());

        let mut settings = (*store.settings()).clone();
        settings.model.model_name = "  o4-mini ".to_string();
        settings.history_window = 0;
        store.update(settings).unwrap();

        assert_eq!(store.settings().model.model_name, "o4-mini");
        assert_eq!(store.settings().history_window, DEFAULT_HISTORY_WINDOW);
        assert!(!store.config_path().with_extension("json.tmp").exists());

        let reopened = SettingsStore::new(store.config_path().to_path_buf(), EnvOverrides::default());
        assert_eq!(*reopened.settings(), *store.settings());
    }

    #[test]
    fn session_id_is_minted_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), None, EnvOverrides::default());

        let first = store.ensure_session_id().unwrap();
        let second = store.ensure_session_id().unwrap();
        assert_eq!(first, second);

        assert!(store.reload());
        assert_eq!(store.ensure_session_id().unwrap(), first);
    }

    #[test]
    fn env_values_are_not_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let env = EnvOverrides {
            api_key: Some("sk-secret".to_string()),
            ..EnvOverrides::default()
        };
        let store = store_in(dir.path(), None, env);

        store.ensure_session_id().unwrap();

        let written = std::fs::read_to_string(store.config_path()).unwrap();
        assert!(!written.contains("sk-secret"));
        assert_eq!(
            store.resolve(&SessionContext::new("s")).api_token,
            "sk-secret"
        );
    }
}
