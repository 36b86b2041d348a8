use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Client configuration loaded from file and/or environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelpdeskConfig {
    /// Active environment profile (`prod` or `dev`).
    pub env: String,
    /// REST origin; requests go to `{api_base_url}/api/...`.
    pub api_base_url: String,
    /// WebSocket URL of the ticket hub.
    pub push_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct ProfileConfig {
    api_base_url: Option<String>,
    push_url: Option<String>,
    request_timeout_secs: Option<u64>,
}

/// Raw TOML file structure for `~/.config/helpdesk/config.toml`.
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    api_base_url: Option<String>,
    push_url: Option<String>,
    request_timeout_secs: Option<u64>,

    active_env: Option<String>,
    prod: Option<ProfileConfig>,
    dev: Option<ProfileConfig>,
}

/// Default config file location, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("helpdesk").join("config.toml"))
}

impl HelpdeskConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Environment variables override profile values, which override flat
    /// file values. A missing file is not an error.
    pub fn load(config_path: Option<&Path>, env_override: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .or_else(default_config_path);

        let file_config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config: {}", path.display()))?;
                toml::from_str::<ConfigFile>(&content)
                    .with_context(|| format!("failed to parse config: {}", path.display()))?
            }
            _ => ConfigFile::default(),
        };

        Self::from_file_and_env(file_config, env_override)
    }

    fn from_file_and_env(file_config: ConfigFile, env_override: Option<&str>) -> Result<Self> {
        let ConfigFile {
            api_base_url,
            push_url,
            request_timeout_secs,
            active_env,
            prod,
            dev,
        } = file_config;

        let env = resolve_env(env_override, active_env.as_deref())?;
        let profile = match env.as_str() {
            "dev" => dev.as_ref(),
            "prod" => prod.as_ref(),
            _ => None,
        };

        let api_base_url = std::env::var("HELPDESK_API_BASE_URL")
            .ok()
            .or_else(|| profile.and_then(|p| p.api_base_url.clone()))
            .or(api_base_url);
        let push_url = std::env::var("HELPDESK_PUSH_URL")
            .ok()
            .or_else(|| profile.and_then(|p| p.push_url.clone()))
            .or(push_url);
        let timeout_secs = match std::env::var("HELPDESK_REQUEST_TIMEOUT_SECS") {
            Ok(raw) => Some(raw.trim().parse::<u64>().with_context(|| {
                format!("HELPDESK_REQUEST_TIMEOUT_SECS must be a number of seconds, got '{}'", raw)
            })?),
            Err(_) => profile
                .and_then(|p| p.request_timeout_secs)
                .or(request_timeout_secs),
        };

        Self::build(env, api_base_url, push_url, timeout_secs)
    }

    fn build(
        env: String,
        api_base_url: Option<String>,
        push_url: Option<String>,
        timeout_secs: Option<u64>,
    ) -> Result<Self> {
        let api_base_url = match api_base_url {
            Some(url) if !url.trim().is_empty() => url.trim().trim_end_matches('/').to_string(),
            _ => bail!(
                "api_base_url is required (set in config file or HELPDESK_API_BASE_URL env var)"
            ),
        };
        let push_url = match push_url {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => bail!("push_url is required (set in config file or HELPDESK_PUSH_URL env var)"),
        };
        let request_timeout = match timeout_secs {
            Some(0) => bail!("request_timeout_secs must be greater than zero"),
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_REQUEST_TIMEOUT,
        };

        Ok(Self {
            env,
            api_base_url,
            push_url,
            request_timeout,
        })
    }
}

fn resolve_env(env_override: Option<&str>, active_env: Option<&str>) -> Result<String> {
    let raw = env_override
        .map(str::to_string)
        .or_else(|| std::env::var("HELPDESK_ENV").ok())
        .or_else(|| active_env.map(str::to_string))
        .unwrap_or_else(|| "prod".to_string());

    match raw.trim().to_ascii_lowercase().as_str() {
        "prod" | "production" => Ok("prod".to_string()),
        "dev" | "development" => Ok("dev".to_string()),
        other => bail!(
            "Invalid helpdesk environment '{}'. Expected 'prod' or 'dev'.",
            other
        ),
    }
}
