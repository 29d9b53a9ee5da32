pub mod pairing;
pub mod whatsapp;

use anyhow::Result;
use async_trait::async_trait;

use crate::media::MediaAttachment;

/// A message received from WhatsApp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Platform message ID, needed to mark it read or fetch its media
    pub id: String,
    /// Chat JID the message came from (`...@c.us`, `...@s.whatsapp.net`, `...@g.us`)
    pub sender: String,
    /// Display name of the user
    pub push_name: String,
    /// The message text or media caption; may be empty
    pub body: String,
    /// Whether an attachment can be downloaded for this message
    pub has_media: bool,
}

impl IncomingMessage {
    pub fn is_group(&self) -> bool {
        is_group_jid(&self.sender)
    }
}

pub fn is_group_jid(jid: &str) -> bool {
    jid.contains("@g.us")
}

/// Outbound side of the messaging platform.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, to: &str, text: &str) -> Result<()>;

    /// Show the message as read on the sender's phone.
    async fn mark_seen(&self, message: &IncomingMessage) -> Result<()>;

    async fn download_media(&self, message: &IncomingMessage) -> Result<MediaAttachment>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_jid_detection() {
        assert!(is_group_jid("12345-6789@g.us"));
        assert!(is_group_jid("120363025246125486@g.us"));
        assert!(!is_group_jid("6281234@c.us"));
        assert!(!is_group_jid("6281234@s.whatsapp.net"));
    }
}
