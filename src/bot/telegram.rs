//! Messaging transport: a minimal delivery/edit seam consumed by the
//! pipeline, plus the teloxide adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use teloxide::ApiError;
use teloxide::RequestError;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, FileId, InputFile, MessageId, ParseMode};
use thiserror::Error;
use tracing::warn;

/// Preferred formatting of outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Html,
    Markdown,
    Plain,
}

/// Handle to a delivered message, usable for later edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHandle {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Edit carried the exact content already displayed.
    #[error("message content unchanged")]
    NotModified,
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
    #[error("rejected by transport: {0}")]
    BadRequest(String),
    #[error("transport network error: {0}")]
    Network(String),
}

/// Outbound side of the messaging transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(
        &self,
        chat_id: i64,
        text: &str,
        format: OutputFormat,
    ) -> Result<MessageHandle, TransportError>;

    async fn edit(
        &self,
        handle: MessageHandle,
        text: &str,
        format: OutputFormat,
    ) -> Result<(), TransportError>;

    /// Best-effort "typing…" indicator.
    async fn typing(&self, _chat_id: i64) {}
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    /// Download a file (photo, voice note) by its Telegram file id.
    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, TransportError> {
        let file = self
            .bot
            .get_file(FileId(file_id.to_string()))
            .await
            .map_err(map_request_error)?;

        let mut data = Vec::new();
        self.bot
            .download_file(&file.path, &mut data)
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(data)
    }

    /// Send an image from bytes.
    pub async fn send_photo(
        &self,
        chat_id: i64,
        image_data: Vec<u8>,
    ) -> Result<(), TransportError> {
        let input_file = InputFile::memory(image_data).file_name("image.png");
        self.bot
            .send_photo(ChatId(chat_id), input_file)
            .await
            .map_err(map_request_error)?;
        Ok(())
    }

    pub async fn upload_photo_action(&self, chat_id: i64) {
        if let Err(e) = self
            .bot
            .send_chat_action(ChatId(chat_id), ChatAction::UploadPhoto)
            .await
        {
            warn!("Failed to send chat action: {e}");
        }
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn deliver(
        &self,
        chat_id: i64,
        text: &str,
        format: OutputFormat,
    ) -> Result<MessageHandle, TransportError> {
        let mut request = self.bot.send_message(ChatId(chat_id), text);
        if let Some(mode) = parse_mode(format) {
            request = request.parse_mode(mode);
        }
        let msg = request.await.map_err(map_request_error)?;
        Ok(MessageHandle {
            chat_id,
            message_id: msg.id.0 as i64,
        })
    }

    async fn edit(
        &self,
        handle: MessageHandle,
        text: &str,
        format: OutputFormat,
    ) -> Result<(), TransportError> {
        let mut request = self.bot.edit_message_text(
            ChatId(handle.chat_id),
            MessageId(handle.message_id as i32),
            text,
        );
        if let Some(mode) = parse_mode(format) {
            request = request.parse_mode(mode);
        }
        request.await.map_err(map_request_error)?;
        Ok(())
    }

    async fn typing(&self, chat_id: i64) {
        if let Err(e) = self
            .bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
        {
            warn!("Failed to send chat action: {e}");
        }
    }
}

fn parse_mode(format: OutputFormat) -> Option<ParseMode> {
    match format {
        OutputFormat::Html => Some(ParseMode::Html),
        OutputFormat::Markdown => Some(ParseMode::Markdown),
        OutputFormat::Plain => None,
    }
}

fn map_request_error(e: RequestError) -> TransportError {
    match e {
        RequestError::Api(ApiError::MessageNotModified) => TransportError::NotModified,
        RequestError::RetryAfter(seconds) => TransportError::RateLimited(seconds.duration()),
        RequestError::Api(api) => TransportError::BadRequest(api.to_string()),
        other => TransportError::Network(other.to_string()),
    }
}
