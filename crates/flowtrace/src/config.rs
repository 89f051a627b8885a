use flowcore::CheckpointError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_CONSOLE_BASE_URL: &str = "http://localhost:3000/console";

const ENV_API_KEY: &str = "FLOW_API_KEY";
const ENV_ORG: &str = "FLOW_ORG";
const ENV_API_BASE_URL: &str = "FLOW_API_BASE_URL";
const ENV_CONSOLE_URL: &str = "FLOW_CONSOLE_URL";
const ENV_CHECKPOINTS: &str = "FLOW_CHECKPOINTS";
const ENV_RUNTIME: &str = "FLOW_RUNTIME";
const ENV_RUNTIME_VERSION: &str = "FLOW_RUNTIME_VERSION";
const ENV_EXECUTION_RUN_ID: &str = "FLOW_EXECUTION_RUN_ID";
const ENV_CONFIG_DIR: &str = "FLOW_CONFIG_DIR";
const ENV_CI: &str = "CI";

/// Console URLs are announced by default, except under CI.
pub fn print_url_by_default<F>(env: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    env(ENV_CI).is_none()
}

/// Explicit construction arguments. Anything left `None` falls back to the
/// environment, then the config file, then defaults.
#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    pub api_key: Option<String>,
    pub org: Option<String>,
    pub api_base_url: Option<String>,
    pub console_base_url: Option<String>,
    pub disabled: bool,
    pub runtime: Option<String>,
    pub runtime_version: Option<String>,
    pub execution_run_id: Option<String>,
}

/// Fully resolved settings for one checkpoint manager.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub org: Option<String>,
    pub api_base_url: String,
    pub console_base_url: String,
    pub runtime: Option<String>,
    pub runtime_version: Option<String>,
    pub execution_run_id: Option<String>,
}

impl CheckpointConfig {
    /// In-memory tracing only; nothing is sent anywhere.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            api_key: None,
            org: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            console_base_url: DEFAULT_CONSOLE_BASE_URL.to_string(),
            runtime: None,
            runtime_version: None,
            execution_run_id: None,
        }
    }

    pub fn enabled(api_key: impl Into<String>, org: impl Into<String>) -> Self {
        Self {
            enabled: true,
            api_key: Some(api_key.into()),
            org: Some(org.into()),
            ..Self::disabled()
        }
    }
}

impl CheckpointOptions {
    /// Resolve against the process environment and the user config file.
    pub fn resolve(self) -> Result<CheckpointConfig, CheckpointError> {
        let env = |key: &str| std::env::var(key).ok();
        let file = FileConfig::load(&env);
        self.resolve_with(env, &file)
    }

    pub fn resolve_with<F>(self, env: F, file: &FileConfig) -> Result<CheckpointConfig, CheckpointError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = self.api_key.or_else(|| env(ENV_API_KEY)).or_else(|| file.api.token.clone());
        let org = self.org.or_else(|| env(ENV_ORG)).or_else(|| file.api.org.clone());
        let api_base_url = self
            .api_base_url
            .or_else(|| env(ENV_API_BASE_URL))
            .or_else(|| file.api.base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let console_base_url = self
            .console_base_url
            .or_else(|| env(ENV_CONSOLE_URL))
            .or_else(|| file.console.base_url.clone())
            .unwrap_or_else(|| DEFAULT_CONSOLE_BASE_URL.to_string());

        let switched_off = env(ENV_CHECKPOINTS)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off"))
            .unwrap_or(false);
        let enabled = api_key.is_some() && !self.disabled && !switched_off;

        if enabled && org.is_none() {
            return Err(CheckpointError::Configuration(format!(
                "Organization not set. Set it via options, the {} environment variable, \
                 or the config file. Disable checkpoints with {}=false or by unsetting {}.",
                ENV_ORG, ENV_CHECKPOINTS, ENV_API_KEY
            )));
        }

        let runtime = self.runtime.or_else(|| env(ENV_RUNTIME));
        if let Some(runtime) = &runtime {
            if runtime != "cloud" && runtime != "sdk" {
                return Err(CheckpointError::InvalidRuntime(runtime.clone()));
            }
        }

        Ok(CheckpointConfig {
            enabled,
            api_key,
            org,
            api_base_url,
            console_base_url,
            runtime,
            runtime_version: self.runtime_version.or_else(|| env(ENV_RUNTIME_VERSION)),
            execution_run_id: self.execution_run_id.or_else(|| env(ENV_EXECUTION_RUN_ID)),
        })
    }
}

/// Contents of `config.toml`.
///
/// ```toml
/// [api]
/// token = "..."
/// org = "my-org"
/// baseUrl = "https://traces.example.com"
///
/// [console]
/// baseUrl = "https://console.example.com"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub console: ConsoleSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiSection {
    pub token: Option<String>,
    pub org: Option<String>,
    #[serde(rename = "baseUrl")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsoleSection {
    #[serde(rename = "baseUrl")]
    pub base_url: Option<String>,
}

impl FileConfig {
    /// Location of the config file, honouring `FLOW_CONFIG_DIR`.
    pub fn path<F>(env: &F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        match env(ENV_CONFIG_DIR) {
            Some(dir) => Some(PathBuf::from(dir).join("config.toml")),
            None => dirs::config_dir().map(|dir| dir.join("flow").join("config.toml")),
        }
    }

    /// Load the user config. A missing or unreadable file is an empty config.
    pub fn load<F>(env: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(path) = Self::path(env) else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::from_path(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, CheckpointError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CheckpointError::ConfigFile(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&text)
            .map_err(|e| CheckpointError::ConfigFile(format!("{}: {}", path.display(), e)))
    }
}
