use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// What to do when the model answers with no text at all.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmptyResponsePolicy {
    /// Tell the sender something went wrong.
    #[default]
    Apologize,
    /// Log it and send nothing.
    Silent,
}

impl std::fmt::Display for EmptyResponsePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmptyResponsePolicy::Apologize => write!(f, "apologize"),
            EmptyResponsePolicy::Silent => write!(f, "silent"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Exchanges kept as context per conversation; older ones are dropped
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            base_url: default_gemini_base_url(),
            max_output_tokens: default_max_output_tokens(),
            max_history_turns: default_max_history_turns(),
        }
    }
}

/// Connection to the Evolution API bridge that speaks WhatsApp Web for us.
#[derive(Debug, Deserialize, Clone)]
pub struct WhatsAppConfig {
    #[serde(default = "default_whatsapp_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    /// Where the pairing QR image is written
    #[serde(default = "default_qr_code_path")]
    pub qr_code_path: PathBuf,
    /// When set, webhook calls must carry it in `x-webhook-secret`
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            api_url: default_whatsapp_api_url(),
            api_key: String::new(),
            instance_name: default_instance_name(),
            qr_code_path: default_qr_code_path(),
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplyConfig {
    #[serde(default = "default_true")]
    pub ignore_groups: bool,
    #[serde(default = "default_true")]
    pub mark_seen: bool,
    /// Prepended to every user message; empty sends the raw text
    #[serde(default = "default_prompt_prefix")]
    pub prompt_prefix: String,
    #[serde(default)]
    pub empty_response: EmptyResponsePolicy,
    #[serde(default = "default_empty_response_message")]
    pub empty_response_message: String,
    #[serde(default = "default_error_message")]
    pub error_message: String,
    #[serde(default = "default_attachment_error_message")]
    pub attachment_error_message: String,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            ignore_groups: true,
            mark_seen: true,
            prompt_prefix: default_prompt_prefix(),
            empty_response: EmptyResponsePolicy::default(),
            empty_response_message: default_empty_response_message(),
            error_message: default_error_message(),
            attachment_error_message: default_attachment_error_message(),
        }
    }
}

fn default_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_max_output_tokens() -> u32 {
    500
}

fn default_max_history_turns() -> usize {
    20
}

fn default_whatsapp_api_url() -> String {
    "http://127.0.0.1:8085".to_string()
}

fn default_instance_name() -> String {
    "xenovia".to_string()
}

fn default_qr_code_path() -> PathBuf {
    PathBuf::from("whatsapp-qr.png")
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_prompt_prefix() -> String {
    "Xenovia AI siap membantu! Tolong jawab dalam Bahasa Indonesia: ".to_string()
}

fn default_empty_response_message() -> String {
    "Maaf, ada masalah dalam memproses permintaan ini. Silakan coba lagi nanti.".to_string()
}

fn default_error_message() -> String {
    "Oops, terjadi kesalahan. Harap coba lagi nanti.".to_string()
}

fn default_attachment_error_message() -> String {
    "Maaf, lampiran ini tidak dapat diproses. Silakan kirim ulang atau coba lagi nanti.".to_string()
}

impl Config {
    /// Load the config file, falling back to defaults when it does not exist,
    /// then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            warn!(
                "Config file {} not found, using defaults and environment",
                path.display()
            );
            Config::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid config TOML")
    }

    /// `GEMINI_API_KEY` wins over the legacy `API_KEY`; `EVOLUTION_API_KEY`
    /// sets the bridge key and `WEBHOOK_SECRET` the webhook secret. Empty
    /// values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("GEMINI_API_KEY").or_else(|| non_empty("API_KEY")) {
            self.gemini.api_key = key;
        }
        if let Some(key) = non_empty("EVOLUTION_API_KEY") {
            self.whatsapp.api_key = key;
        }
        if let Some(secret) = non_empty("WEBHOOK_SECRET") {
            self.whatsapp.webhook_secret = Some(secret);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.gemini.api_key.trim().is_empty() {
            anyhow::bail!(
                "Gemini API key is missing: set [gemini] api_key or the GEMINI_API_KEY environment variable"
            );
        }
        if self.gemini.max_output_tokens == 0 {
            anyhow::bail!("[gemini] max_output_tokens must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.gemini.model, "gemini-1.5-flash");
        assert_eq!(config.gemini.max_output_tokens, 500);
        assert_eq!(config.gemini.max_history_turns, 20);
        assert_eq!(config.whatsapp.webhook_secret, None);
        assert_eq!(config.server.port, 8080);
        assert!(config.reply.ignore_groups);
        assert!(config.reply.mark_seen);
        assert_eq!(config.reply.empty_response, EmptyResponsePolicy::Apologize);
        assert!(config.reply.prompt_prefix.starts_with("Xenovia AI siap membantu!"));
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            [gemini]
            api_key = "key-from-file"
            model = "gemini-2.0-flash"
            max_output_tokens = 256
            max_history_turns = 5

            [whatsapp]
            api_url = "http://bridge:8080"
            instance_name = "bot"
            webhook_secret = "s3cret"

            [reply]
            ignore_groups = false
            prompt_prefix = ""
            empty_response = "silent"
            "#,
        )
        .unwrap();

        assert_eq!(config.gemini.api_key, "key-from-file");
        assert_eq!(config.gemini.model, "gemini-2.0-flash");
        assert_eq!(config.gemini.max_output_tokens, 256);
        assert_eq!(config.whatsapp.api_url, "http://bridge:8080");
        assert_eq!(config.whatsapp.instance_name, "bot");
        assert_eq!(config.gemini.max_history_turns, 5);
        assert_eq!(config.whatsapp.webhook_secret.as_deref(), Some("s3cret"));
        assert!(!config.reply.ignore_groups);
        assert!(config.reply.mark_seen);
        assert!(config.reply.prompt_prefix.is_empty());
        assert_eq!(config.reply.empty_response, EmptyResponsePolicy::Silent);
    }

    #[test]
    fn test_unknown_empty_response_policy_is_rejected() {
        let result = Config::from_toml_str("[reply]\nempty_response = \"shout\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_gemini_key_env_precedence() {
        let mut config = Config::default();
        config.apply_env_overrides(|key| match key {
            "GEMINI_API_KEY" => Some("gemini-key".to_string()),
            "API_KEY" => Some("legacy-key".to_string()),
            _ => None,
        });
        assert_eq!(config.gemini.api_key, "gemini-key");

        let mut config = Config::default();
        config.apply_env_overrides(|key| match key {
            "GEMINI_API_KEY" => Some("  ".to_string()),
            "API_KEY" => Some("legacy-key".to_string()),
            "EVOLUTION_API_KEY" => Some("bridge-key".to_string()),
            "WEBHOOK_SECRET" => Some("hook-secret".to_string()),
            _ => None,
        });
        assert_eq!(config.gemini.api_key, "legacy-key");
        assert_eq!(config.whatsapp.api_key, "bridge-key");
        assert_eq!(config.whatsapp.webhook_secret.as_deref(), Some("hook-secret"));
    }

    #[test]
    fn test_validate_requires_api_key() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.gemini.api_key = "abc".to_string();
        assert!(config.validate().is_ok());

        config.gemini.max_output_tokens = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_qr_code_path() {
        let config = Config::from_toml_str("[gemini]\napi_key = \"x\"\n").unwrap();
        assert_eq!(config.whatsapp.qr_code_path, PathBuf::from("whatsapp-qr.png"));
    }
}
