use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use murmur_assistant::completion::{DEFAULT_COMPLETION_URL, DEFAULT_MODEL};
use murmur_assistant::ResponderConfig;
use murmur_core::identity::DEFAULT_TOKEN_TTL_DAYS;

/// Secrets that ship in examples and must never sign real tokens.
const PLACEHOLDER_SECRETS: &[&str] = &["", "changeme", "change-me", "dev-secret-change-me", "secret"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MURMUR_JWT_SECRET must be set to a real secret")]
    MissingSecret,
    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    pub assistant_email: String,
    pub assistant_name: String,
    pub completion_url: String,
    pub completion_model: String,
    pub api_key: Option<String>,
    pub responder: ResponderConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str, default: &str| vars.get(name).cloned().unwrap_or_else(|| default.to_string());

        let jwt_secret = vars.get("MURMUR_JWT_SECRET").cloned().unwrap_or_default();
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.trim()) {
            return Err(ConfigError::MissingSecret);
        }

        let defaults = ResponderConfig::default();
        let responder = ResponderConfig {
            context_window: parse(&vars, "MURMUR_CONTEXT_WINDOW", defaults.context_window)?,
            workers: parse(&vars, "MURMUR_REPLY_WORKERS", defaults.workers)?,
            queue_capacity: parse(&vars, "MURMUR_REPLY_QUEUE", defaults.queue_capacity)?,
            generation_timeout: Duration::from_secs(parse(
                &vars,
                "MURMUR_GENERATION_TIMEOUT_SECS",
                defaults.generation_timeout.as_secs(),
            )?),
        };

        Ok(Self {
            jwt_secret,
            token_ttl: chrono::Duration::days(parse(&vars, "MURMUR_TOKEN_TTL_DAYS", DEFAULT_TOKEN_TTL_DAYS)?),
            db_path: PathBuf::from(get("MURMUR_DB_PATH", "murmur.db")),
            host: get("MURMUR_HOST", "0.0.0.0"),
            port: parse(&vars, "MURMUR_PORT", 3000)?,
            upload_dir: PathBuf::from(get("MURMUR_UPLOAD_DIR", "./uploads")),
            assistant_email: get("MURMUR_ASSISTANT_EMAIL", "assistant@murmur.local"),
            assistant_name: get("MURMUR_ASSISTANT_NAME", "Murmur AI"),
            completion_url: get("MURMUR_COMPLETION_URL", DEFAULT_COMPLETION_URL),
            completion_model: get("MURMUR_COMPLETION_MODEL", DEFAULT_MODEL),
            api_key: vars.get("MISTRAL_API_KEY").cloned().filter(|k| !k.trim().is_empty()),
            responder,
        })
    }
}

fn parse<T: FromStr>(vars: &HashMap<String, String>, name: &'static str, default: T) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value: value.clone(),
        }),
    }
}
