use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chatline_assistant::{DEFAULT_ENDPOINT, ServiceConfig};
use chatline_core::{DEFAULT_GREETING, SessionConfig};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "chatline";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "CHATLINE_";
pub const DEFAULT_LOG_FILTER: &str = "warn,chatline=info";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_greeting")]
    pub greeting: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            greeting: default_greeting(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            log_filter: default_log_filter(),
        }
    }
}

impl Settings {
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig::new(&self.endpoint)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::with_greeting(self.greeting.clone())
    }

    pub fn normalized(mut self) -> Self {
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.greeting = non_blank_or(self.greeting, default_greeting);
        self.log_filter = non_blank_or(self.log_filter, default_log_filter);
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = default_connect_timeout_secs();
        }
        self
    }
}

/// Values given on the command line. They win over every other layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettingsOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".chatline"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Loads defaults, then the JSON file, then `CHATLINE_*` variables, then `overrides`.
    pub fn open(
        config_path: PathBuf,
        overrides: &SettingsOverrides,
    ) -> Result<Self, SettingsError> {
        let settings = Self::load_layers(&config_path, overrides)?;
        Ok(Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        })
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_layers(path: &Path, overrides: &SettingsOverrides) -> Result<Settings, SettingsError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::debug!("settings file not found at {:?}, using defaults", path);
        }

        figment
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(overrides))
            .extract::<Settings>()
            .map(Settings::normalized)
            .map_err(Box::new)
            .context(ExtractSnafu {
                stage: "extract-settings",
                path: path.to_path_buf(),
            })
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

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to load settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        source: Box<figment::Error>,
    },
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

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_greeting() -> String {
    DEFAULT_GREETING.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    // Tests that read the environment run inside a jail.
    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            let store = SettingsStore::open(
                jail.directory().join(SETTINGS_FILE_NAME),
                &SettingsOverrides::default(),
            )
            .map_err(|error| error.to_string())?;

            assert_eq!(*store.settings(), Settings::default());
            Ok(())
        });
    }

    #[test]
    fn layers_apply_in_order() {
        Jail::expect_with(|jail| {
            jail.create_file(
                SETTINGS_FILE_NAME,
                r#"{"endpoint":"http://file:9000","greeting":"From file","request_timeout_secs":5}"#,
            )?;
            jail.set_env("CHATLINE_GREETING", "From env");

            let path = jail.directory().join(SETTINGS_FILE_NAME);
            let store = SettingsStore::open(path.clone(), &SettingsOverrides::default())
                .map_err(|error| error.to_string())?;
            let settings = store.settings();
            assert_eq!(settings.endpoint, "http://file:9000");
            assert_eq!(settings.greeting, "From env");
            assert_eq!(settings.request_timeout_secs, 5);
            assert_eq!(settings.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS);

            let overrides = SettingsOverrides {
                endpoint: Some("http://cli:7000".to_string()),
                greeting: None,
            };
            let store = SettingsStore::open(path, &overrides).map_err(|error| error.to_string())?;
            assert_eq!(store.settings().endpoint, "http://cli:7000");
            assert_eq!(store.settings().greeting, "From env");
            Ok(())
        });
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let settings = Settings {
            endpoint: "   ".to_string(),
            greeting: String::new(),
            request_timeout_secs: 0,
            connect_timeout_secs: 3,
            log_filter: " debug ".to_string(),
        }
        .normalized();

        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.greeting, DEFAULT_GREETING);
        assert_eq!(settings.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
        assert_eq!(settings.connect_timeout_secs, 3);
        assert_eq!(settings.log_filter, "debug");
    }

    #[test]
    fn malformed_file_is_an_error() {
        Jail::expect_with(|jail| {
            jail.create_file(SETTINGS_FILE_NAME, "{ not json")?;

            let result = SettingsStore::open(
                jail.directory().join(SETTINGS_FILE_NAME),
                &SettingsOverrides::default(),
            );

            assert!(matches!(result, Err(SettingsError::Extract { .. })));
            Ok(())
        });
    }

    #[test]
    fn update_persists_atomically_and_reloads() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("nested").join(SETTINGS_FILE_NAME);
            let store = SettingsStore::open(path.clone(), &SettingsOverrides::default())
                .map_err(|error| error.to_string())?;

            let mut settings = (*store.settings()).clone();
            settings.endpoint = " http://saved:8100 ".to_string();
            store.update(settings).map_err(|error| error.to_string())?;

            assert_eq!(store.settings().endpoint, "http://saved:8100");
            assert!(path.exists());
            assert!(!path.with_extension("json.tmp").exists());

            let reopened = SettingsStore::open(path, &SettingsOverrides::default())
                .map_err(|error| error.to_string())?;
            assert_eq!(reopened.settings().endpoint, "http://saved:8100");
            Ok(())
        });
    }

    #[test]
    fn converts_into_runtime_configs() {
        let settings = Settings {
            endpoint: "http://localhost:8000/".to_string(),
            request_timeout_secs: 30,
            ..Settings::default()
        };

        let service = settings.service_config();
        assert_eq!(service.endpoint, "http://localhost:8000");
        assert_eq!(service.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.session_config().greeting, DEFAULT_GREETING);
    }
}
