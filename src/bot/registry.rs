//! Static chat-mode and model registries.
//!
//! Both registries ship with built-in defaults and can be overridden or
//! extended from the config file.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::bot::telegram::OutputFormat;

/// A selectable persona preset.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMode {
    pub name: String,
    pub prompt_start: String,
    pub welcome_message: String,
    #[serde(default)]
    pub parse_mode: OutputFormat,
}

/// A selectable completion model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 1-5 capability scores shown in the settings menu.
    #[serde(default)]
    pub scores: BTreeMap<String, u8>,
    pub price_per_1000_input_tokens: f64,
    pub price_per_1000_output_tokens: f64,
    #[serde(default)]
    pub supports_vision: bool,
}

/// Registry of chat modes and models, fixed after startup.
#[derive(Debug, Clone)]
pub struct Registry {
    chat_modes: BTreeMap<String, ChatMode>,
    models: BTreeMap<String, ModelInfo>,
    available_text_models: Vec<String>,
    /// Price per generated image (image generation endpoint).
    pub price_per_image: f64,
    /// Price per transcribed minute (audio endpoint).
    pub price_per_transcription_minute: f64,
}

impl Registry {
    pub fn new(
        chat_modes: BTreeMap<String, ChatMode>,
        models: BTreeMap<String, ModelInfo>,
        available_text_models: Vec<String>,
    ) -> Self {
        Self {
            chat_modes,
            models,
            available_text_models,
            price_per_image: 0.02,
            price_per_transcription_minute: 0.006,
        }
    }

    /// Merge config-provided entries over the built-in defaults. An empty
    /// available-model list keeps the default list.
    pub fn with_overrides(
        mut self,
        chat_modes: BTreeMap<String, ChatMode>,
        models: BTreeMap<String, ModelInfo>,
        available_text_models: Vec<String>,
    ) -> Self {
        self.chat_modes.extend(chat_modes);
        self.models.extend(models);
        if !available_text_models.is_empty() {
            self.available_text_models = available_text_models;
        }
        self
    }

    pub fn chat_mode(&self, key: &str) -> Option<&ChatMode> {
        self.chat_modes.get(key)
    }

    pub fn chat_mode_keys(&self) -> impl Iterator<Item = &str> {
        self.chat_modes.keys().map(String::as_str)
    }

    pub fn n_chat_modes(&self) -> usize {
        self.chat_modes.len()
    }

    pub fn model(&self, key: &str) -> Option<&ModelInfo> {
        self.models.get(key)
    }

    pub fn available_text_models(&self) -> &[String] {
        &self.available_text_models
    }

    pub fn default_chat_mode(&self) -> &str {
        "assistant"
    }

    pub fn default_model(&self) -> &str {
        self.available_text_models
            .first()
            .map(String::as_str)
            .unwrap_or("gpt-4o-mini")
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(
            default_chat_modes(),
            default_models(),
            vec![
                "gpt-4o-mini".to_string(),
                "gpt-4o".to_string(),
                "gpt-3.5-turbo".to_string(),
                "gpt-4".to_string(),
            ],
        )
    }
}

fn default_chat_modes() -> BTreeMap<String, ChatMode> {
    let mut modes = BTreeMap::new();
    modes.insert(
        "assistant".to_string(),
        ChatMode {
            name: "👩🏼‍🎓 General Assistant".to_string(),
            prompt_start: "You are an advanced chatbot assistant. Your primary goal is to \
                           assist users to the best of your ability. Use HTML tags like \
                           <b>bold</b> and <i>italic</i> for formatting when helpful."
                .to_string(),
            welcome_message: "👩🏼‍🎓 Hi, I'm your <b>general assistant</b>. How can I help you?"
                .to_string(),
            parse_mode: OutputFormat::Html,
        },
    );
    modes.insert(
        "code_assistant".to_string(),
        ChatMode {
            name: "👩🏼‍💻 Code Assistant".to_string(),
            prompt_start: "You are an advanced programming assistant. Help users write and \
                           debug code. Format all code as <code>inline code</code> or \
                           <pre>code blocks</pre>."
                .to_string(),
            welcome_message: "👩🏼‍💻 Hi, I'm your <b>code assistant</b>. How can I help you?"
                .to_string(),
            parse_mode: OutputFormat::Html,
        },
    );
    modes.insert(
        "artist".to_string(),
        ChatMode {
            name: "👩‍🎨 Artist".to_string(),
            prompt_start: String::new(),
            welcome_message: "👩‍🎨 Hi, I'm the <b>artist</b>. Describe an image and I'll draw it!"
                .to_string(),
            parse_mode: OutputFormat::Html,
        },
    );
    modes.insert(
        "english_tutor".to_string(),
        ChatMode {
            name: "🇬🇧 English Tutor".to_string(),
            prompt_start: "You are an English tutor. Correct the user's grammar and suggest \
                           more natural phrasing, then answer their message."
                .to_string(),
            welcome_message: "🇬🇧 Hi, I'm your <b>English tutor</b>. Write me something!"
                .to_string(),
            parse_mode: OutputFormat::Html,
        },
    );
    modes
}

fn default_models() -> BTreeMap<String, ModelInfo> {
    let mut models = BTreeMap::new();
    models.insert(
        "gpt-4o-mini".to_string(),
        ModelInfo {
            name: "GPT-4o mini".to_string(),
            description: "Fast and inexpensive, good for everyday questions".to_string(),
            scores: scores(3, 5, 5),
            price_per_1000_input_tokens: 0.00015,
            price_per_1000_output_tokens: 0.0006,
            supports_vision: true,
        },
    );
    models.insert(
        "gpt-4o".to_string(),
        ModelInfo {
            name: "GPT-4o".to_string(),
            description: "The flagship model: smartest, understands images".to_string(),
            scores: scores(5, 4, 3),
            price_per_1000_input_tokens: 0.005,
            price_per_1000_output_tokens: 0.015,
            supports_vision: true,
        },
    );
    models.insert(
        "gpt-3.5-turbo".to_string(),
        ModelInfo {
            name: "GPT-3.5 Turbo".to_string(),
            description: "Legacy fast model".to_string(),
            scores: scores(3, 5, 5),
            price_per_1000_input_tokens: 0.0015,
            price_per_1000_output_tokens: 0.002,
            supports_vision: false,
        },
    );
    models.insert(
        "gpt-4".to_string(),
        ModelInfo {
            name: "GPT-4".to_string(),
            description: "Strong reasoning, slower and pricier".to_string(),
            scores: scores(5, 2, 2),
            price_per_1000_input_tokens: 0.03,
            price_per_1000_output_tokens: 0.06,
            supports_vision: false,
        },
    );
    models
}

fn scores(smart: u8, fast: u8, cheap: u8) -> BTreeMap<String, u8> {
    let mut s = BTreeMap::new();
    s.insert("Smart".to_string(), smart);
    s.insert("Fast".to_string(), fast);
    s.insert("Cheap".to_string(), cheap);
    s
}
