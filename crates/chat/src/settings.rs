use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use sokhan_llm::{BackendConfig, DEFAULT_MODEL_TYPE, ModelParameters};

use crate::controller::{ControllerOptions, DEFAULT_RECONCILE_DELAY};
use crate::watchdog::DEFAULT_STALL_TIMEOUT;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080/api";
pub const SETTINGS_DIRECTORY_NAME: &str = "sokhan";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "SOKHAN_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub web_search: bool,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_reconcile_delay_secs")]
    pub reconcile_delay_secs: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: String::new(),
            model_type: default_model_type(),
            web_search: false,
            reasoning: false,
            stall_timeout_secs: default_stall_timeout_secs(),
            reconcile_delay_secs: default_reconcile_delay_secs(),
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.endpoint = if self.endpoint.trim().is_empty() {
            default_endpoint()
        } else {
            self.endpoint.trim().trim_end_matches('/').to_string()
        };
        self.api_key = self.api_key.trim().to_string();
        self.model_type = if self.model_type.trim().is_empty() {
            default_model_type()
        } else {
            self.model_type.trim().to_string()
        };
        // A zero bound would time out every stream immediately.
        if self.stall_timeout_secs == 0 {
            self.stall_timeout_secs = default_stall_timeout_secs();
        }

        self
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::new(&self.endpoint).with_api_key(&self.api_key)
    }

    pub fn model_parameters(&self) -> ModelParameters {
        ModelParameters::new(&self.model_type)
            .with_web_search(self.web_search)
            .with_reasoning(self.reasoning)
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            reconcile_delay: Duration::from_secs(self.reconcile_delay_secs),
            parameters: self.model_parameters(),
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".sokhan"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    /// Normalizes, writes to disk, then publishes to readers.
    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let settings = settings.normalized();
        let json = serde_json::to_vec_pretty(&settings).context(EncodeSnafu {
            stage: "encode-settings",
        })?;
        write_atomically(&self.config_path, &json)?;

        tracing::info!(path = ?self.config_path, "settings saved");
        self.settings.store(Arc::new(settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ChatSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "no settings file yet, starting from defaults");
        }

        // Later providers win: file over defaults, environment over file.
        let extracted = Figment::from(Serialized::defaults(ChatSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract::<ChatSettings>();

        extracted.map(ChatSettings::normalized).unwrap_or_else(|error| {
            tracing::warn!(path = ?path, error = %error, "settings unreadable, falling back to defaults");
            ChatSettings::default()
        })
    }
}

/// Stages the write beside `path`, then renames over it.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), SettingsError> {
    if let Some(directory) = path.parent() {
        std::fs::create_dir_all(directory).context(CreateDirectorySnafu {
            stage: "create-settings-directory",
            path: directory.to_path_buf(),
        })?;
    }

    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, contents).context(WriteStagingSnafu {
        stage: "write-staging-file",
        path: staging.clone(),
    })?;
    std::fs::rename(&staging, path).context(ReplaceSnafu {
        stage: "replace-settings-file",
        path: path.to_path_buf(),
    })
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot create {path:?} on `{stage}`: {source}"))]
    CreateDirectory {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode settings on `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot write {path:?} on `{stage}`: {source}"))]
    WriteStaging {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot move staged settings into {path:?} on `{stage}`: {source}"))]
    Replace {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model_type() -> String {
    DEFAULT_MODEL_TYPE.to_string()
}

fn default_stall_timeout_secs() -> u64 {
    DEFAULT_STALL_TIMEOUT.as_secs()
}

fn default_reconcile_delay_secs() -> u64 {
    DEFAULT_RECONCILE_DELAY.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("sokhan-settings-{}", uuid::Uuid::new_v4()))
            .join(SETTINGS_FILE_NAME)
    }

    #[test]
    fn normalization_fills_blanks_and_trims() {
        let settings = ChatSettings {
            endpoint: " https://chat.example/api/ ".to_string(),
            api_key: "  key ".to_string(),
            model_type: " ".to_string(),
            stall_timeout_secs: 0,
            ..ChatSettings::default()
        }
        .normalized();

        assert_eq!(settings.endpoint, "https://chat.example/api");
        assert_eq!(settings.api_key, "key");
        assert_eq!(settings.model_type, DEFAULT_MODEL_TYPE);
        assert_eq!(settings.stall_timeout_secs, 15);
        assert_eq!(settings.backend_config().api_key.as_deref(), Some("key"));
    }

    #[test]
    fn controller_options_follow_settings() {
        let settings = ChatSettings {
            model_type: "deepseek-r1".to_string(),
            reasoning: true,
            stall_timeout_secs: 20,
            reconcile_delay_secs: 5,
            ..ChatSettings::default()
        };

        let options = settings.controller_options();
        assert_eq!(options.stall_timeout, Duration::from_secs(20));
        assert_eq!(options.reconcile_delay, Duration::from_secs(5));
        assert_eq!(
            options.parameters,
            ModelParameters::new("deepseek-r1").with_reasoning(true)
        );
    }

    #[test]
    fn update_persists_and_reloads() {
        let path = scratch_path();
        let store = SettingsStore::new(path.clone());
        assert_eq!(store.settings().model_type, DEFAULT_MODEL_TYPE);

        store
            .update(ChatSettings {
                endpoint: "https://chat.example/api".to_string(),
                web_search: true,
                ..ChatSettings::default()
            })
            .expect("persist settings");

        let reloaded = SettingsStore::new(path.clone());
        assert_eq!(reloaded.settings().endpoint, "https://chat.example/api");
        assert!(reloaded.settings().web_search);
        assert!(!path.with_extension("json.tmp").exists());

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let path = scratch_path();
        let dir = path.parent().expect("scratch dir");
        std::fs::create_dir_all(dir).expect("create dir");
        std::fs::write(&path, r#"{ "model_type": "o3" }"#).expect("write settings");

        let settings = SettingsStore::new(path.clone()).settings();
        assert_eq!(settings.model_type, "o3");
        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.reconcile_delay_secs, 3);

        let _ = std::fs::remove_dir_all(dir);
    }
}
