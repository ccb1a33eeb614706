//! Configuration loading and validation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::bot::registry::{ChatMode, ModelInfo, Registry};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    ParseJson {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("config validation error: {0}")]
    Validation(String),
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    openai_api_key: String,
    #[serde(default = "default_api_base")]
    openai_api_base: String,
    /// Seconds of inactivity after which a message starts a fresh dialog.
    #[serde(default = "default_new_dialog_timeout")]
    new_dialog_timeout: u64,
    #[serde(default = "default_true")]
    enable_message_streaming: bool,
    /// Max chars per delivered message before the answer is chunked.
    #[serde(default = "default_message_limit")]
    message_limit: usize,
    #[serde(default = "default_n_generated_images")]
    return_n_generated_images: u32,
    #[serde(default = "default_image_size")]
    image_size: String,
    #[serde(default = "default_n_chat_modes_per_page")]
    n_chat_modes_per_page: usize,
    /// Directory for state files (database, logs). Defaults to the current
    /// directory.
    data_dir: Option<String>,
    /// Extra or overriding chat modes merged over the built-ins.
    #[serde(default)]
    chat_modes: BTreeMap<String, ChatMode>,
    /// Extra or overriding models merged over the built-ins.
    #[serde(default)]
    models: BTreeMap<String, ModelInfo>,
    /// Model keys selectable in /settings; the first one is the default.
    #[serde(default)]
    available_text_models: Vec<String>,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_new_dialog_timeout() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_message_limit() -> usize {
    4096
}

fn default_n_generated_images() -> u32 {
    1
}

fn default_image_size() -> String {
    "512x512".to_string()
}

fn default_n_chat_modes_per_page() -> usize {
    5
}

pub struct Config {
    pub telegram_bot_token: String,
    pub openai_api_key: String,
    pub openai_api_base: String,
    pub new_dialog_timeout: u64,
    pub enable_message_streaming: bool,
    pub message_limit: usize,
    pub return_n_generated_images: u32,
    pub image_size: String,
    pub n_chat_modes_per_page: usize,
    pub data_dir: PathBuf,
    pub registry: Registry,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadFile {
            path: config_path.clone(),
            source: e,
        })?;
        let file: ConfigFile =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseJson {
                path: config_path.clone(),
                source: e,
            })?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token is required".into(),
            ));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2
            || token_parts[0].parse::<u64>().is_err()
            || token_parts[1].is_empty()
        {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)"
                    .into(),
            ));
        }
        if file.openai_api_key.is_empty() {
            return Err(ConfigError::Validation("openai_api_key is required".into()));
        }
        if file.message_limit == 0 {
            return Err(ConfigError::Validation(
                "message_limit must be positive".into(),
            ));
        }

        let registry = Registry::default().with_overrides(
            file.chat_modes,
            file.models,
            file.available_text_models,
        );
        for model_key in registry.available_text_models() {
            if registry.model(model_key).is_none() {
                return Err(ConfigError::Validation(format!(
                    "available model '{model_key}' has no entry in the model registry"
                )));
            }
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            openai_api_key: file.openai_api_key,
            openai_api_base: file.openai_api_base,
            new_dialog_timeout: file.new_dialog_timeout,
            enable_message_streaming: file.enable_message_streaming,
            message_limit: file.message_limit,
            return_n_generated_images: file.return_n_generated_images,
            image_size: file.image_size,
            n_chat_modes_per_page: file.n_chat_modes_per_page,
            data_dir,
            registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn assert_err(result: Result<Config, ConfigError>) -> ConfigError {
        match result {
            Ok(_) => panic!("expected error, got Ok"),
            Err(e) => e,
        }
    }

    #[test]
    fn test_valid_config() {
        let file = write_config(
            r#"{
            "telegram_bot_token": "123456789:ABCdefGHIjklMNOpqrsTUVwxyz",
            "openai_api_key": "sk-test"
        }"#,
        );
        let config = Config::load(file.path()).expect("should load valid config");
        assert_eq!(config.openai_api_base, "https://api.openai.com/v1");
        assert_eq!(config.new_dialog_timeout, 600);
        assert!(config.enable_message_streaming);
        assert_eq!(config.message_limit, 4096);
        assert!(config.registry.chat_mode("assistant").is_some());
    }

    #[test]
    fn test_empty_token() {
        let file = write_config(r#"{"telegram_bot_token": "", "openai_api_key": "sk-test"}"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("telegram_bot_token"));
    }

    #[test]
    fn test_invalid_token_format() {
        let file =
            write_config(r#"{"telegram_bot_token": "not_a_token", "openai_api_key": "sk-test"}"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_missing_api_key() {
        let file =
            write_config(r#"{"telegram_bot_token": "123456789:ABCdef", "openai_api_key": ""}"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("openai_api_key"));
    }

    #[test]
    fn test_unknown_available_model_rejected() {
        let file = write_config(
            r#"{
            "telegram_bot_token": "123456789:ABCdef",
            "openai_api_key": "sk-test",
            "available_text_models": ["made-up-model"]
        }"#,
        );
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("made-up-model"));
    }

    #[test]
    fn test_custom_chat_mode_merges_over_defaults() {
        let file = write_config(
            r#"{
            "telegram_bot_token": "123456789:ABCdef",
            "openai_api_key": "sk-test",
            "chat_modes": {
                "pirate": {
                    "name": "🏴‍☠️ Pirate",
                    "prompt_start": "You are a pirate.",
                    "welcome_message": "Arr!",
                    "parse_mode": "plain"
                }
            }
        }"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert!(config.registry.chat_mode("pirate").is_some());
        assert!(config.registry.chat_mode("assistant").is_some());
    }

    #[test]
    fn test_file_not_found() {
        let err = assert_err(Config::load("/nonexistent/path/config.json"));
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let file = write_config("{ invalid json }");
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::ParseJson { .. }));
    }
}
