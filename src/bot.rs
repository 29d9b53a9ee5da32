use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{EmptyResponsePolicy, ReplyConfig};
use crate::llm::{ChatModel, Part};
use crate::media;
use crate::platform::{IncomingMessage, Messenger};
use crate::sessions::SessionStore;

/// Answers WhatsApp messages with the model. Every failure inside a turn is
/// contained here; nothing propagates back to the event source.
pub struct Bot {
    messenger: Arc<dyn Messenger>,
    sessions: SessionStore,
    reply: ReplyConfig,
}

impl Bot {
    pub fn new(
        model: Arc<dyn ChatModel>,
        messenger: Arc<dyn Messenger>,
        reply: ReplyConfig,
    ) -> Self {
        Self {
            messenger,
            sessions: SessionStore::new(model),
            reply,
        }
    }

    /// Handle one inbound message: at most one reply goes out.
    pub async fn handle_message(&self, msg: IncomingMessage) {
        if self.reply.ignore_groups && msg.is_group() {
            info!("Message from group {} ignored", msg.sender);
            return;
        }

        info!(
            "Received message from {} ({}): {}",
            msg.push_name, msg.sender, msg.body
        );

        let media_part = if msg.has_media {
            match self.messenger.download_media(&msg).await {
                Ok(attachment) => {
                    debug!(
                        "Downloaded {} attachment from {}",
                        attachment.mime_type, msg.sender
                    );
                    Some(media::to_generative_part(&attachment))
                }
                Err(e) => {
                    error!("Failed to download media from {}: {:#}", msg.sender, e);
                    self.dispatch(&self.reply.attachment_error_message, &msg.sender)
                        .await;
                    return;
                }
            }
        } else {
            None
        };

        if self.reply.mark_seen {
            if let Err(e) = self.messenger.mark_seen(&msg).await {
                warn!("Failed to mark message {} as read: {:#}", msg.id, e);
            }
        }

        self.run(&msg.body, &msg.sender, media_part).await;
    }

    /// Generate a reply through the sender's conversation and send it back.
    pub async fn run(&self, message: &str, sender: &str, media_part: Option<Part>) {
        let session = self.sessions.get_or_create(sender).await;

        let prompt = self.compose_prompt(message, media_part);

        let result = {
            let mut chat = session.lock().await;
            chat.send_message(prompt).await
        };

        match result {
            Ok(text) if !text.is_empty() => {
                info!("Generated text for {}: {}", sender, text);
                self.dispatch(&text, sender).await;
            }
            Ok(_) => {
                error!(
                    "Empty response from model for {} (model limitations or API rate limits)",
                    sender
                );
                match self.reply.empty_response {
                    EmptyResponsePolicy::Apologize => {
                        self.dispatch(&self.reply.empty_response_message, sender)
                            .await;
                    }
                    EmptyResponsePolicy::Silent => {}
                }
            }
            Err(e) => {
                error!("Error generating reply for {}: {:#}", sender, e);
                self.dispatch(&self.reply.error_message, sender).await;
            }
        }
    }

    /// Text part first, then the attachment. The text part is left out only
    /// when it is empty and an attachment carries the message.
    fn compose_prompt(&self, message: &str, media_part: Option<Part>) -> Vec<Part> {
        let text = format!("{}{}", self.reply.prompt_prefix, message);

        let mut prompt = Vec::with_capacity(2);
        if !text.is_empty() || media_part.is_none() {
            prompt.push(Part::text(text));
        }
        if let Some(part) = media_part {
            prompt.push(part);
        }
        prompt
    }

    /// Best-effort send: failures are logged and dropped.
    pub async fn dispatch(&self, text: &str, to: &str) {
        if let Err(e) = self.messenger.send_text(to, text).await {
            error!("Failed to send WhatsApp message to {}: {:#}", to, e);
        }
    }
}
