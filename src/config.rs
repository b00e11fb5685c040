use crate::api::DEFAULT_BASE_URL;
use crate::render::RenderOptions;
use crate::truncate::TruncateOptions;
use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_KEY_ENV: &str = "OPENHANDS_API_KEY";
pub const BASE_URL_ENV: &str = "OPENHANDS_APP_BASE";
pub const CONFIG_PATH_ENV: &str = "OPENHANDS_EXPORT_CONFIG";

#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub export: ExportConfig,
    pub render: RenderConfig,
    pub truncate: TruncateConfig,
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ExportConfig {
    pub page_limit: u32,
    pub sleep_ms: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            page_limit: 100,
            sleep_ms: 0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    pub head: usize,
    pub tail: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        let defaults = RenderOptions::default();
        RenderConfig {
            head: defaults.head,
            tail: defaults.tail,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TruncateConfig {
    pub max_len: usize,
    pub head: usize,
    pub tail: usize,
}

impl Default for TruncateConfig {
    fn default() -> Self {
        let defaults = TruncateOptions::default();
        TruncateConfig {
            max_len: defaults.max_len,
            head: defaults.head,
            tail: defaults.tail,
        }
    }
}

impl Config {
    /// Load config from ~/.openhands-export/config.toml (or
    /// `$OPENHANDS_EXPORT_CONFIG`), writing a default file on first use.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            let default_config = Config::default();
            // A read-only home shouldn't stop an export
            if let Err(e) = default_config.save_to(config_path) {
                warn!("Could not write default config: {:#}", e);
            }
            return Ok(default_config);
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config from {}", config_path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", config_path.display()))?;

        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Ensure directory exists
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let content_with_header = format!(
            "# openhands-export configuration\n\
             # The API key is never read from this file; set {} instead.\n\
             # {} overrides [api].base_url.\n\
             \n{}",
            API_KEY_ENV, BASE_URL_ENV, content
        );

        fs::write(config_path, content_with_header)
            .with_context(|| format!("Failed to write config to {}", config_path.display()))?;

        info!("Created config file at: {}", config_path.display());
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }

        let home = std::env::var("USERPROFILE")
            .or_else(|_| std::env::var("HOME"))
            .context("Neither USERPROFILE nor HOME environment variable is set")?;

        Ok(PathBuf::from(home)
            .join(".openhands-export")
            .join("config.toml"))
    }

    /// Base URL by precedence: command line, `OPENHANDS_APP_BASE`, config file.
    pub fn base_url(&self, cli_override: Option<&str>) -> String {
        let env_override = std::env::var(BASE_URL_ENV).ok();
        resolve_base_url(cli_override, env_override.as_deref(), &self.api.base_url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs.max(1))
    }

    pub fn page_delay(&self, cli_override_ms: Option<u64>) -> Option<Duration> {
        let ms = cli_override_ms.unwrap_or(self.export.sleep_ms);
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    pub fn render_options(&self, head: Option<usize>, tail: Option<usize>) -> RenderOptions {
        RenderOptions {
            head: head.unwrap_or(self.render.head),
            tail: tail.unwrap_or(self.render.tail),
        }
    }

    pub fn truncate_options(
        &self,
        max_len: Option<usize>,
        head: Option<usize>,
        tail: Option<usize>,
    ) -> TruncateOptions {
        TruncateOptions {
            max_len: max_len.unwrap_or(self.truncate.max_len),
            head: head.unwrap_or(self.truncate.head),
            tail: tail.unwrap_or(self.truncate.tail),
        }
    }
}

fn resolve_base_url(cli: Option<&str>, env: Option<&str>, configured: &str) -> String {
    [cli, env]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .unwrap_or(configured)
        .trim_end_matches('/')
        .to_string()
}

/// The API key from `OPENHANDS_API_KEY`.
pub fn api_key() -> Result<String> {
    std::env::var(API_KEY_ENV)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .with_context(|| format!("{} is required", API_KEY_ENV))
}
