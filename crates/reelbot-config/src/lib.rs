//! Reelbot Configuration
//!
//! TOML configuration loading with environment variable support

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "REELBOT_";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub radarr: RadarrConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub bot_name: Option<String>,
    pub poll_timeout_secs: Option<u64>,
    pub client_recreate_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub password: String,
    /// Telegram user id of the owner. When unset, the first user to `/auth`
    /// claims ownership.
    #[serde(default)]
    pub owner_id: Option<i64>,
    #[serde(default)]
    pub acl_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadarrConfig {
    #[serde(default = "default_radarr_host")]
    pub host: String,
    #[serde(default = "default_radarr_port")]
    pub port: u16,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub url_base: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub root_folder: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for RadarrConfig {
    fn default() -> Self {
        Self {
            host: default_radarr_host(),
            port: default_radarr_port(),
            api_key: String::new(),
            url_base: String::new(),
            ssl: false,
            username: None,
            password: None,
            root_folder: None,
            timeout_secs: None,
        }
    }
}

impl RadarrConfig {
    /// Root of the v3 API, always ending with a slash.
    pub fn api_base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        let base = self.url_base.trim().trim_matches('/');
        if base.is_empty() {
            format!("{}://{}:{}/api/v3/", scheme, self.host.trim(), self.port)
        } else {
            format!(
                "{}://{}:{}/{}/api/v3/",
                scheme,
                self.host.trim(),
                self.port,
                base
            )
        }
    }

    pub fn basic_auth(&self) -> Option<(String, Option<String>)> {
        let username = self
            .username
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())?;
        Some((username.to_string(), self.password.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_radarr_host() -> String {
    "localhost".to_string()
}

fn default_radarr_port() -> u16 {
    7878
}

fn default_session_ttl_secs() -> u64 {
    120
}

fn default_sweep_interval_secs() -> u64 {
    150
}

/// Expands a leading `~` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            if path == "~" {
                return home;
            }
            return home.join(path.trim_start_matches("~/"));
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("reelbot").join("config.toml"))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.core
            .data_dir
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(expand_path)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".reelbot")
            })
    }

    pub fn acl_path(&self) -> PathBuf {
        self.auth
            .acl_file
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(expand_path)
            .unwrap_or_else(|| self.data_dir().join("acl.json"))
    }

    pub fn log_level(&self) -> &str {
        self.core.log_level.as_deref().unwrap_or("info")
    }

    /// Applies `REELBOT_*` overrides. `lookup` receives the full variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|value| !value.trim().is_empty())
        };

        if let Some(value) = get("TELEGRAM_TOKEN") {
            self.telegram.bot_token = value;
        }
        if let Some(value) = get("AUTH_PASSWORD") {
            self.auth.password = value;
        }
        if let Some(value) = get("OWNER_ID") {
            let id = value
                .trim()
                .parse::<i64>()
                .map_err(|_| anyhow::anyhow!("{}OWNER_ID must be numeric", ENV_PREFIX))?;
            self.auth.owner_id = Some(id);
        }
        if let Some(value) = get("RADARR_HOST") {
            self.radarr.host = value;
        }
        if let Some(value) = get("RADARR_PORT") {
            self.radarr.port = value
                .trim()
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("{}RADARR_PORT must be a port number", ENV_PREFIX))?;
        }
        if let Some(value) = get("RADARR_API_KEY") {
            self.radarr.api_key = value;
        }
        if let Some(value) = get("RADARR_URL_BASE") {
            self.radarr.url_base = value;
        }
        if let Some(value) = get("RADARR_SSL") {
            self.radarr.ssl = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(value) = get("RADARR_USERNAME") {
            self.radarr.username = Some(value);
        }
        if let Some(value) = get("RADARR_PASSWORD") {
            self.radarr.password = Some(value);
        }
        if let Some(value) = get("DATA_DIR") {
            self.core.data_dir = Some(value);
        }
        if let Some(value) = get("LOG_LEVEL") {
            self.core.log_level = Some(value);
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token cannot be empty");
        }
        if !self.telegram.bot_token.contains(':') {
            anyhow::bail!("telegram.bot_token must look like '<bot id>:<secret>'");
        }
        if self.auth.password.trim().is_empty() {
            anyhow::bail!("auth.password cannot be empty");
        }
        if self.radarr.host.trim().is_empty() {
            anyhow::bail!("radarr.host cannot be empty");
        }
        if self.radarr.port == 0 {
            anyhow::bail!("radarr.port cannot be 0");
        }
        if self.radarr.api_key.trim().is_empty() {
            anyhow::bail!("radarr.api_key cannot be empty");
        }
        if self.session.ttl_secs == 0 {
            anyhow::bail!("session.ttl_secs must be greater than 0");
        }
        if self.session.sweep_interval_secs == 0 {
            anyhow::bail!("session.sweep_interval_secs must be greater than 0");
        }
        Ok(())
    }
}

/// Template written by `reelbot config init`.
pub const CONFIG_TEMPLATE: &str = r#"[core]
# data_dir = "~/.reelbot"
log_level = "info"

[telegram]
bot_token = "123456:replace-me"
# poll_timeout_secs = 60
# client_recreate_interval_secs = 60

[auth]
password = "change-me"
# owner_id = 123456789
# acl_file = "~/.reelbot/acl.json"

[radarr]
host = "localhost"
port = 7878
api_key = "replace-me"
url_base = ""
ssl = false
# username = ""
# password = ""
# root_folder = "/movies"
# timeout_secs = 30

[session]
ttl_secs = 120
sweep_interval_secs = 150
"#;
