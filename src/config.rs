//! Configuration management
//!
//! All runtime configuration comes from the environment; `Config::from_env`
//! is called once at startup and the result is shared behind an `Arc`.
//! Missing credentials for a collaborator are a startup fault, not a
//! per-call surprise.

use anyhow::{Context, Result};
use serde::Serialize;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub telephony: TelephonyConfig,
    pub speech: SpeechConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub audit: AuditConfig,
    pub call: CallConfig,
}

/// Credentials and endpoints for the telephony provider.
#[derive(Debug, Clone, Serialize)]
pub struct TelephonyConfig {
    pub account_sid: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    /// E.164 number outbound calls are placed from.
    pub from_number: String,
    /// REST API base, overridable for tests.
    pub api_base: String,
}

/// STT and TTS collaborator settings.
#[derive(Debug, Clone, Serialize)]
pub struct SpeechConfig {
    #[serde(skip_serializing)]
    pub stt_api_key: String,
    /// Streaming transcription endpoint (WSS).
    pub stt_endpoint: String,
    #[serde(skip_serializing)]
    pub tts_api_key: String,
    pub tts_region: String,
}

/// LLM collaborator settings.
#[derive(Debug, Clone, Serialize)]
pub struct LlmConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub api_base: String,
}

/// Public surface of this process.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// Public HTTPS base announced to the telephony provider.
    pub base_url: String,
    /// Public WSS URL the provider connects media streams to.
    pub websocket_url: String,
    pub http_port: u16,
}

/// Audit store and calendar endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct AuditConfig {
    /// Append-only audit endpoint; empty disables remote persistence.
    pub db_uri: String,
    pub calendar_uri: String,
}

/// Per-call behavior knobs.
#[derive(Debug, Clone, Serialize)]
pub struct CallConfig {
    pub phonebook_path: String,
    pub filler_dir: String,
    /// Wait between the teammate leg winding down and dialling the customer.
    pub outbound_cooldown_secs: u64,
    pub termination_grace_ms: u64,
}

fn var(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("missing required env var {name}"))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Required: telephony credentials, STT/TTS/LLM keys, public URLs.
    /// Everything else has a default.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            telephony: TelephonyConfig {
                account_sid: var("TELEPHONY_ACCOUNT_SID")?,
                auth_token: var("TELEPHONY_AUTH_TOKEN")?,
                from_number: var("TELEPHONY_FROM_NUMBER")?,
                api_base: var_or("TELEPHONY_API_BASE", "https://api.twilio.com"),
            },
            speech: SpeechConfig {
                stt_api_key: var("STT_API_KEY")?,
                stt_endpoint: var_or("STT_ENDPOINT", "wss://api.deepgram.com/v1/listen"),
                tts_api_key: var("TTS_API_KEY")?,
                tts_region: var_or("TTS_REGION", "westeurope"),
            },
            llm: LlmConfig {
                api_key: var("LLM_API_KEY")?,
                model: var_or("LLM_MODEL", "gpt-4o-mini"),
                api_base: var_or("LLM_API_BASE", "https://api.openai.com/v1"),
            },
            server: ServerConfig {
                base_url: var("BASE_URL")?,
                websocket_url: var("WEBSOCKET_URL")?,
                http_port: var_or("HTTP_PORT", "8080")
                    .parse()
                    .context("HTTP_PORT must be a port number")?,
            },
            audit: AuditConfig {
                db_uri: var_or("AUDIT_DB_URI", ""),
                calendar_uri: var_or("CALENDAR_URI", "http://localhost:9090/calendar"),
            },
            call: CallConfig {
                phonebook_path: var_or("PHONEBOOK_PATH", "phonebook.json"),
                filler_dir: var_or("FILLER_DIR", "fillers"),
                outbound_cooldown_secs: var_or("OUTBOUND_COOLDOWN_SECS", "20")
                    .parse()
                    .context("OUTBOUND_COOLDOWN_SECS must be an integer")?,
                termination_grace_ms: var_or("TERMINATION_GRACE_MS", "3000")
                    .parse()
                    .context("TERMINATION_GRACE_MS must be an integer")?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !crate::types::is_e164(&self.telephony.from_number) {
            anyhow::bail!(
                "TELEPHONY_FROM_NUMBER {:?} is not E.164",
                self.telephony.from_number
            );
        }
        if !self.server.websocket_url.starts_with("wss://")
            && !self.server.websocket_url.starts_with("ws://")
        {
            anyhow::bail!("WEBSOCKET_URL must be a ws:// or wss:// URL");
        }
        url::Url::parse(&self.server.base_url).context("BASE_URL is not a valid URL")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            telephony: TelephonyConfig {
                account_sid: "AC123".into(),
                auth_token: "secret".into(),
                from_number: "+15005550006".into(),
                api_base: "https://api.twilio.com".into(),
            },
            speech: SpeechConfig {
                stt_api_key: "k".into(),
                stt_endpoint: "wss://api.deepgram.com/v1/listen".into(),
                tts_api_key: "k".into(),
                tts_region: "westeurope".into(),
            },
            llm: LlmConfig {
                api_key: "k".into(),
                model: "gpt-4o-mini".into(),
                api_base: "https://api.openai.com/v1".into(),
            },
            server: ServerConfig {
                base_url: "https://agent.example.com".into(),
                websocket_url: "wss://agent.example.com/media".into(),
                http_port: 8080,
            },
            audit: AuditConfig { db_uri: String::new(), calendar_uri: "http://localhost:9090/calendar".into() },
            call: CallConfig {
                phonebook_path: "phonebook.json".into(),
                filler_dir: "fillers".into(),
                outbound_cooldown_secs: 20,
                termination_grace_ms: 3000,
            },
        }
    }

    #[test]
    fn validate_accepts_sane_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_from_number() {
        let mut config = base_config();
        config.telephony.from_number = "12345".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_ws_url() {
        let mut config = base_config();
        config.server.websocket_url = "https://agent.example.com/media".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn secrets_do_not_serialize() {
        let out = serde_json::to_string(&base_config()).unwrap();
        assert!(!out.contains("secret"));
    }
}
