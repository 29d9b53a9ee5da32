//! WhatsApp through an Evolution API bridge.
//!
//! The bridge runs WhatsApp Web (Baileys) for us: replies, read receipts and
//! media downloads go over its REST API, and inbound messages arrive as
//! webhooks on our own HTTP listener.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::bot::Bot;
use crate::config::{ServerConfig, WhatsAppConfig};
use crate::media::MediaAttachment;
use crate::platform::{pairing, IncomingMessage, Messenger};

/// Message types that carry a downloadable attachment.
const MEDIA_MESSAGE_KINDS: [&str; 5] = [
    "imageMessage",
    "videoMessage",
    "audioMessage",
    "documentMessage",
    "stickerMessage",
];

/// Answer to `instance/connect`: a PNG QR code, the raw QR payload and/or a
/// pairing code.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct PairingInfo {
    #[serde(default)]
    pub base64: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, rename = "pairingCode")]
    pub pairing_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaResponse {
    base64: String,
    #[serde(default)]
    mimetype: Option<String>,
}

/// REST client for one Evolution API instance.
pub struct EvolutionClient {
    client: reqwest::Client,
    config: WhatsAppConfig,
}

impl EvolutionClient {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            path,
            self.config.instance_name
        )
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let url = self.url(path);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.config.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach WhatsApp bridge at {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("WhatsApp bridge error on {} ({}): {}", path, status, error_body);
        }

        Ok(response)
    }

    /// Ask the bridge to (re)connect the instance. Returns the QR code to
    /// scan when the instance is not paired yet.
    pub async fn connect(&self) -> Result<PairingInfo> {
        let url = self.url("instance/connect");
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header("apikey", &self.config.api_key)
            .send()
            .await
            .with_context(|| format!("Failed to reach WhatsApp bridge at {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("WhatsApp bridge connect failed ({}): {}", status, error_body);
        }

        response
            .json()
            .await
            .context("Failed to parse WhatsApp bridge connect response")
    }
}

#[async_trait]
impl Messenger for EvolutionClient {
    async fn send_text(&self, to: &str, text: &str) -> Result<()> {
        self.post_json("message/sendText", &json!({ "number": to, "text": text }))
            .await?;
        Ok(())
    }

    async fn mark_seen(&self, message: &IncomingMessage) -> Result<()> {
        let body = json!({
            "readMessages": [{
                "remoteJid": message.sender,
                "fromMe": false,
                "id": message.id,
            }]
        });
        self.post_json("chat/markMessageAsRead", &body).await?;
        Ok(())
    }

    async fn download_media(&self, message: &IncomingMessage) -> Result<MediaAttachment> {
        let body = json!({
            "message": { "key": { "id": message.id } },
            "convertToMp4": false,
        });
        let media: MediaResponse = self
            .post_json("chat/getBase64FromMediaMessage", &body)
            .await?
            .json()
            .await
            .context("Failed to parse media download response")?;

        Ok(MediaAttachment {
            data: media.base64,
            mime_type: media
                .mimetype
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        })
    }
}

/// Webhook events we act on.
#[derive(Debug, PartialEq)]
pub enum WebhookEvent {
    Messages(Vec<IncomingMessage>),
    QrCode(PairingInfo),
    Connection(String),
    Ignored(String),
}

/// Evolution sends `messages.upsert` or `MESSAGES_UPSERT` depending on how
/// the webhook was configured.
fn normalize_event_name(name: &str) -> String {
    name.to_ascii_lowercase().replace('_', ".")
}

pub fn parse_event(payload: &Value) -> WebhookEvent {
    let event = normalize_event_name(payload["event"].as_str().unwrap_or(""));
    let data = &payload["data"];

    match event.as_str() {
        "messages.upsert" => {
            let messages = match data.as_array() {
                Some(items) => items.iter().filter_map(parse_message).collect(),
                None => parse_message(data).into_iter().collect(),
            };
            WebhookEvent::Messages(messages)
        }
        "qrcode.updated" => {
            let qrcode = &data["qrcode"];
            let field = |name: &str| qrcode[name].as_str().map(str::to_string);
            WebhookEvent::QrCode(PairingInfo {
                base64: field("base64").or_else(|| qrcode.as_str().map(str::to_string)),
                code: field("code"),
                pairing_code: field("pairingCode"),
            })
        }
        "connection.update" => {
            WebhookEvent::Connection(data["state"].as_str().unwrap_or("").to_string())
        }
        _ => WebhookEvent::Ignored(event),
    }
}

/// Pull the fields we need out of one Baileys message. Our own messages,
/// status broadcasts and messages with neither text nor media (reactions,
/// edits, poll votes, protocol notices) yield `None`.
fn parse_message(data: &Value) -> Option<IncomingMessage> {
    let key = &data["key"];
    if key["fromMe"].as_bool().unwrap_or(false) {
        return None;
    }

    let sender = key["remoteJid"].as_str().filter(|jid| !jid.is_empty())?;
    if sender == "status@broadcast" {
        return None;
    }

    let id = key["id"].as_str().unwrap_or("").to_string();
    let message = &data["message"];

    let media_kind = MEDIA_MESSAGE_KINDS
        .iter()
        .find(|kind| message.get(**kind).is_some());

    let body = message["conversation"]
        .as_str()
        .or_else(|| message["extendedTextMessage"]["text"].as_str())
        .or_else(|| media_kind.and_then(|kind| message[*kind]["caption"].as_str()))
        .unwrap_or("")
        .to_string();

    if media_kind.is_none() && body.is_empty() {
        let kind = message
            .as_object()
            .and_then(|fields| fields.keys().next())
            .map(String::as_str)
            .unwrap_or("empty");
        debug!("Skipping {} from {}", kind, sender);
        return None;
    }

    Some(IncomingMessage {
        id,
        sender: sender.to_string(),
        push_name: data["pushName"].as_str().unwrap_or(sender).to_string(),
        body,
        has_media: media_kind.is_some(),
    })
}

/// Header the bridge must send when `whatsapp.webhook_secret` is set.
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Clone)]
struct WebhookState {
    bot: Arc<Bot>,
    qr_code_path: Arc<PathBuf>,
    instance_name: Arc<str>,
    secret: Option<Arc<str>>,
}

impl WebhookState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        match &self.secret {
            None => true,
            Some(secret) => headers
                .get(WEBHOOK_SECRET_HEADER)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|given| given == secret.as_ref()),
        }
    }
}

pub fn router(bot: Arc<Bot>, config: &WhatsAppConfig) -> Router {
    let state = WebhookState {
        bot,
        qr_code_path: Arc::new(config.qr_code_path.clone()),
        instance_name: Arc::from(config.instance_name.as_str()),
        secret: config
            .webhook_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(Arc::from),
    };

    Router::new()
        .route("/", get(liveness))
        .route("/webhook/whatsapp", post(webhook))
        .with_state(state)
}

async fn liveness() -> &'static str {
    "OK"
}

/// Acknowledge right away; each message is answered on its own task.
async fn webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> StatusCode {
    if !state.authorized(&headers) {
        warn!("Rejected webhook call without a valid {}", WEBHOOK_SECRET_HEADER);
        return StatusCode::UNAUTHORIZED;
    }

    if let Some(instance) = payload["instance"].as_str() {
        if instance != state.instance_name.as_ref() {
            debug!("Ignoring webhook for foreign instance '{}'", instance);
            return StatusCode::OK;
        }
    }

    match parse_event(&payload) {
        WebhookEvent::Messages(messages) => {
            for msg in messages {
                let bot = Arc::clone(&state.bot);
                tokio::spawn(async move {
                    bot.handle_message(msg).await;
                });
            }
        }
        WebhookEvent::QrCode(qr) => {
            pairing::show_qr(&qr, &state.qr_code_path);
        }
        WebhookEvent::Connection(connection) => match connection.as_str() {
            "open" => info!("WhatsApp Web client is ready!"),
            "close" => warn!("WhatsApp connection closed"),
            other => debug!("WhatsApp connection state: {}", other),
        },
        WebhookEvent::Ignored(event) => debug!("Ignoring webhook event '{}'", event),
    }

    StatusCode::OK
}

/// Serve the webhook and liveness routes until the process stops.
pub async fn serve(bot: Arc<Bot>, whatsapp: &WhatsAppConfig, server: &ServerConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", server.host, server.port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Listening for WhatsApp webhooks on http://{}", addr);

    axum::serve(listener, router(bot, whatsapp))
        .await
        .context("HTTP server error")?;

    Ok(())
}
