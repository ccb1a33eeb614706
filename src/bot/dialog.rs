//! Dialog and turn types shared by the store, the prompt builder and the
//! pipeline.
//!
//! A turn's user side is either a plain string (legacy records) or an
//! ordered list of typed content blocks. New turns are always written in
//! block form; `first_text` is total over both shapes so readers never
//! have to care.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One user-input / model-output exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub user: UserContent,
    pub bot: String,
    pub date: DateTime<Utc>,
}

impl Turn {
    pub fn new(user: UserContent, bot: String) -> Self {
        Self {
            user,
            bot,
            date: Utc::now(),
        }
    }
}

/// User side of a turn: plain text or typed blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A single typed content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Image { image: String },
}

impl UserContent {
    /// Text-only content, stored in block form.
    pub fn text(text: impl Into<String>) -> Self {
        UserContent::Blocks(vec![ContentBlock::Text { text: text.into() }])
    }

    /// Text plus one base64-encoded JPEG image.
    pub fn with_image(text: impl Into<String>, image_b64: String) -> Self {
        UserContent::Blocks(vec![
            ContentBlock::Text { text: text.into() },
            ContentBlock::Image { image: image_b64 },
        ])
    }

    /// First text content of the turn. Total: a block list without a text
    /// block yields the empty string.
    pub fn first_text(&self) -> &str {
        match self {
            UserContent::Text(s) => s,
            UserContent::Blocks(blocks) => blocks
                .iter()
                .find_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Image { .. } => None,
                })
                .unwrap_or(""),
        }
    }
}
