use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::gemini;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub bot: BotConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            run_migrations: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelegramConfig {
    pub token: String,
    pub api_url: String,
    pub poll_timeout_seconds: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_url: "https://api.telegram.org".to_string(),
            poll_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub api_key: String,
    pub base_url: String,
    pub request_timeout_seconds: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: gemini::GEMINI_PRO.to_string(),
            api_key: String::new(),
            base_url: gemini::DEFAULT_BASE_URL.to_string(),
            request_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BotConfig {
    pub welcome_text: String,
    pub link_label: String,
    pub link_url: String,
    pub failure_text: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            welcome_text: "Hello! I am an AI chatbot backed by a Gemini model.\n\nPlease write your message."
                .to_string(),
            link_label: "Source code".to_string(),
            link_url: String::new(),
            failure_text: "Sorry, something went wrong. Please re-send your message".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load `path` (optional) layered under `RELAY__SECTION__KEY` environment
    /// variables, then fill empty secrets from the conventional variables.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("RELAY").separator("__"))
            .build()?;
        let mut config: Self = s.try_deserialize()?;
        config.fill_secrets(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// `BOT_TOKEN`, `GEMINI_API_KEY` and `DATABASE_URL` only apply where the
    /// layered config left the field empty.
    pub fn fill_secrets(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let fill = |field: &mut String, key: &str| {
            if field.is_empty() {
                if let Some(value) = lookup(key) {
                    *field = value;
                }
            }
        };
        fill(&mut self.telegram.token, "BOT_TOKEN");
        fill(&mut self.model.api_key, "GEMINI_API_KEY");
        fill(&mut self.database.url, "DATABASE_URL");
    }

    /// Startup checks. Any failure here is fatal to the process.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telegram.token.is_empty() {
            return Err(ConfigError::Message("telegram.token is not set".into()));
        }
        if self.model.api_key.is_empty() {
            return Err(ConfigError::Message("model.api_key is not set".into()));
        }
        if !gemini::is_supported(&self.model.name) {
            return Err(ConfigError::Message(format!(
                "model {} is not supported",
                self.model.name
            )));
        }
        if self.database.url.is_empty() {
            return Err(ConfigError::Message("database.url is not set".into()));
        }
        Ok(())
    }
}
