use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18620;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Hard cap per inbound dialogue frame.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;
/// Bounded sentence queue between the reply stream and the TTS adapter.
pub const SENTENCE_CHANNEL_CAPACITY: usize = 64;

/// Top-level process config (memoir.toml + MEMOIR_* env overrides).
///
/// Runtime tunables (thresholds, session budgets, model selection) live in
/// the `settings` table instead — this file only carries what the process
/// needs before it can open the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoirConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Responses-API provider endpoint and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.memoir/memoir.db", home)
}
fn default_provider_base_url() -> String {
    "https://ark.cn-beijing.volces.com/api/v3".to_string()
}

impl MemoirConfig {
    /// Load config from a TOML file with MEMOIR_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.memoir/memoir.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: MemoirConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MEMOIR_").split("_"))
            .extract()
            .map_err(|e| crate::error::MemoirError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.memoir/memoir.toml", home)
}
