//! The per-user message-processing pipeline.
//!
//! Admission → prompt assembly → completion (streamed or whole) →
//! incremental presentation → turn save → usage accounting. Placeholder
//! edits are best-effort; the authoritative turn save and usage recording
//! are not. All unexpected failures are logged in full and reduced to one
//! generic user-visible message.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bot::completion::{CompletionClient, CompletionError, StreamUpdate};
use crate::bot::context::UserInput;
use crate::bot::dialog::Turn;
use crate::bot::presenter::StreamPresenter;
use crate::bot::serializer::{AdmissionPermit, Busy, RequestSerializer};
use crate::bot::store::{Store, StoreError};
use crate::bot::telegram::{OutputFormat, Transport, TransportError};
use crate::bot::usage::TokenUsage;
use crate::config::Config;

const BUSY_MESSAGE: &str = "⏳ Please wait for a reply to the previous message, or send /cancel";
const CANCELED_MESSAGE: &str = "✅ Canceled";
const NOTHING_TO_RETRY_MESSAGE: &str = "❌ No message to retry 🤷‍♂️";
const PLACEHOLDER_TEXT: &str = "✏️";
const GENERIC_FAILURE_MESSAGE: &str = "❌ Something went wrong. Please try again later";
const CONTEXT_EXHAUSTED_MESSAGE: &str =
    "❌ The dialog is too long for the model even after trimming. Please start a new one with /new";
const VISION_UNSUPPORTED_MESSAGE: &str =
    "❌ The current model can't see photos. Pick a vision-capable model in /settings";

/// Telegram-side identity of a sender.
#[derive(Debug, Clone)]
pub struct Profile {
    pub user_id: i64,
    pub chat_id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("chat mode '{0}' is not configured")]
    UnknownChatMode(String),
}

enum Outcome {
    Done { n_trimmed: usize },
    Cancelled,
}

pub struct ChatPipeline {
    config: Arc<Config>,
    store: Arc<Store>,
    client: Arc<CompletionClient>,
    transport: Arc<dyn Transport>,
    serializer: Arc<RequestSerializer>,
}

impl ChatPipeline {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        client: Arc<CompletionClient>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            store,
            client,
            transport,
            serializer: Arc::new(RequestSerializer::new()),
        }
    }

    /// Register the user on first contact and make sure a current dialog
    /// exists.
    pub fn ensure_registered(&self, profile: &Profile) -> Result<(), StoreError> {
        let registry = &self.config.registry;
        let created = self.store.add_new_user(
            profile.user_id,
            profile.chat_id,
            profile.username.as_deref(),
            &profile.first_name,
            profile.last_name.as_deref(),
            registry.default_chat_mode(),
            registry.default_model(),
        )?;
        if created {
            info!(
                "Registered new user {} ({})",
                profile.first_name, profile.user_id
            );
        }
        if self.store.get_user(profile.user_id)?.current_dialog_id.is_none() {
            self.store.start_new_dialog(profile.user_id)?;
        }
        Ok(())
    }

    pub fn is_busy(&self, user_id: i64) -> bool {
        self.serializer.is_busy(user_id)
    }

    /// Cancel the user's in-flight generation, if any.
    pub async fn cancel(&self, user_id: i64) -> bool {
        self.serializer.cancel(user_id).await
    }

    /// Process a new user message (text, or text plus a photo).
    pub async fn handle_message(&self, profile: &Profile, input: UserInput) {
        if let Err(e) = self.admit_and_run(profile, input).await {
            error!("Message handling failed for user {}: {e}", profile.user_id);
            self.transport
                .deliver(profile.chat_id, GENERIC_FAILURE_MESSAGE, OutputFormat::Plain)
                .await
                .ok();
        }
    }

    /// Re-generate the answer to the last turn of the current dialog.
    /// Gated through the same per-user permit as regular messages, since
    /// it rewrites the turn sequence.
    pub async fn retry_last(&self, profile: &Profile) {
        if let Err(e) = self.admit_and_retry(profile).await {
            error!("Retry failed for user {}: {e}", profile.user_id);
            self.transport
                .deliver(profile.chat_id, GENERIC_FAILURE_MESSAGE, OutputFormat::Plain)
                .await
                .ok();
        }
    }

    async fn admit_and_run(
        &self,
        profile: &Profile,
        input: UserInput,
    ) -> Result<(), PipelineError> {
        self.ensure_registered(profile)?;

        // Capability check happens before admission and before any remote call
        if input.image_jpeg.is_some() {
            let user = self.store.get_user(profile.user_id)?;
            let supports_vision = self
                .config
                .registry
                .model(&user.current_model)
                .map(|m| m.supports_vision)
                .unwrap_or(false);
            if !supports_vision {
                self.transport
                    .deliver(profile.chat_id, VISION_UNSUPPORTED_MESSAGE, OutputFormat::Plain)
                    .await
                    .ok();
                return Ok(());
            }
        }

        let permit = match self.serializer.admit(profile.user_id) {
            Ok(permit) => permit,
            Err(Busy) => {
                self.transport
                    .deliver(profile.chat_id, BUSY_MESSAGE, OutputFormat::Plain)
                    .await
                    .ok();
                return Ok(());
            }
        };

        self.run_generation(permit, profile, input, true).await;
        Ok(())
    }

    async fn admit_and_retry(&self, profile: &Profile) -> Result<(), PipelineError> {
        self.ensure_registered(profile)?;

        let permit = match self.serializer.admit(profile.user_id) {
            Ok(permit) => permit,
            Err(Busy) => {
                self.transport
                    .deliver(profile.chat_id, BUSY_MESSAGE, OutputFormat::Plain)
                    .await
                    .ok();
                return Ok(());
            }
        };

        let mut turns = self.store.get_turns(profile.user_id, None)?;
        let Some(last) = turns.pop() else {
            self.transport
                .deliver(profile.chat_id, NOTHING_TO_RETRY_MESSAGE, OutputFormat::Plain)
                .await
                .ok();
            return Ok(());
        };
        self.store.replace_turns(profile.user_id, None, &turns)?;

        let input = UserInput::text(last.user.first_text());
        self.run_generation(permit, profile, input, false).await;
        Ok(())
    }

    /// Run one generation under an admission permit, reducing every failure
    /// to a user-visible message.
    async fn run_generation(
        &self,
        permit: AdmissionPermit,
        profile: &Profile,
        input: UserInput,
        use_new_dialog_timeout: bool,
    ) {
        let chat_id = profile.chat_id;
        let cancel = CancellationToken::new();
        let inflight = self.serializer.register(&permit, cancel.clone());

        let outcome = self
            .generate(&cancel, profile, &input, use_new_dialog_timeout)
            .await;

        drop(inflight);
        drop(permit);

        match outcome {
            Ok(Outcome::Done { n_trimmed }) => {
                if n_trimmed > 0 {
                    let note = format!(
                        "⚠️ The dialog was too long, so the <b>{n_trimmed}</b> oldest \
                         message(s) were dropped from the context.\nSend /new to start fresh"
                    );
                    self.transport
                        .deliver(chat_id, &note, OutputFormat::Html)
                        .await
                        .ok();
                }
            }
            Ok(Outcome::Cancelled) => {
                info!("Generation cancelled for user {}", profile.user_id);
                self.transport
                    .deliver(chat_id, CANCELED_MESSAGE, OutputFormat::Plain)
                    .await
                    .ok();
            }
            Err(e) => {
                error!("Generation failed for user {}: {e}", profile.user_id);
                let message = match &e {
                    PipelineError::Completion(CompletionError::ContextExhausted) => {
                        CONTEXT_EXHAUSTED_MESSAGE
                    }
                    _ => GENERIC_FAILURE_MESSAGE,
                };
                self.transport
                    .deliver(chat_id, message, OutputFormat::Plain)
                    .await
                    .ok();
            }
        }
    }

    async fn generate(
        &self,
        cancel: &CancellationToken,
        profile: &Profile,
        input: &UserInput,
        use_new_dialog_timeout: bool,
    ) -> Result<Outcome, PipelineError> {
        let user_id = profile.user_id;
        let chat_id = profile.chat_id;
        let registry = &self.config.registry;

        let user = self.store.get_user(user_id)?;

        if use_new_dialog_timeout {
            let idle = Utc::now()
                .signed_duration_since(user.last_interaction)
                .num_seconds();
            if idle > self.config.new_dialog_timeout as i64
                && !self.store.get_turns(user_id, None)?.is_empty()
            {
                self.store.start_new_dialog(user_id)?;
                let mode_name = registry
                    .chat_mode(&user.current_chat_mode)
                    .map(|m| m.name.as_str())
                    .unwrap_or(&user.current_chat_mode);
                let note = format!(
                    "⏰ Starting a new dialog due to timeout (<b>{mode_name}</b> mode) ✅"
                );
                self.transport
                    .deliver(chat_id, &note, OutputFormat::Html)
                    .await
                    .ok();
            }
        }

        self.store.set_last_interaction(user_id, Utc::now())?;

        let mode = registry
            .chat_mode(&user.current_chat_mode)
            .or_else(|| registry.chat_mode(registry.default_chat_mode()))
            .cloned()
            .ok_or_else(|| PipelineError::UnknownChatMode(user.current_chat_mode.clone()))?;
        let model_key = user.current_model;

        self.transport.typing(chat_id).await;
        let placeholder = self
            .transport
            .deliver(chat_id, PLACEHOLDER_TEXT, OutputFormat::Plain)
            .await?;

        let history = self.store.get_turns(user_id, None)?;
        let mut presenter = StreamPresenter::new(
            self.transport.clone(),
            placeholder,
            mode.parse_mode,
            self.config.message_limit,
        );

        let (answer, usage, n_trimmed) = if self.config.enable_message_streaming {
            let mut stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                stream = self.client.stream_chat(&model_key, &mode, input, &history) => stream?,
            };

            let mut answer = String::new();
            let mut usage = TokenUsage::default();
            let mut n_trimmed = stream.n_trimmed();
            loop {
                let update = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        // Commit what was already spent before unwinding.
                        self.store.record_usage(user_id, &model_key, usage)?;
                        return Ok(Outcome::Cancelled);
                    }
                    update = stream.next() => update?,
                };
                match update {
                    Some(StreamUpdate::Partial { answer: a, usage: u }) => {
                        answer = a;
                        usage = u;
                        presenter.push_partial(&answer).await;
                    }
                    Some(StreamUpdate::Finished {
                        answer: a,
                        usage: u,
                        n_trimmed: t,
                    }) => {
                        answer = a;
                        usage = u;
                        n_trimmed = t;
                        break;
                    }
                    None => break,
                }
            }
            (answer, usage, n_trimmed)
        } else {
            let completion = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                completion = self.client.send_chat(&model_key, &mode, input, &history) => completion?,
            };
            (completion.answer, completion.usage, completion.n_trimmed)
        };

        presenter.finish(&answer).await?;

        // Authoritative save: read-modify-write the full turn sequence.
        let mut turns = self.store.get_turns(user_id, None)?;
        turns.push(Turn::new(input.to_content(), answer));
        self.store.replace_turns(user_id, None, &turns)?;
        self.store.record_usage(user_id, &model_key, usage)?;

        Ok(Outcome::Done { n_trimmed })
    }
}
