//! Telephony provider client and stream-connect documents
//!
//! Two jobs: place outbound calls over the provider's REST API, and build
//! the XML documents webhook responses use to route a call's media onto
//! our WebSocket endpoint with the right stream parameters attached.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::backoff::{retry_with_deadline, RetryPolicy};
use crate::config::TelephonyConfig;
use crate::error::{CollabResult, CollaboratorError};

const DISPATCH_DEADLINE: Duration = Duration::from_secs(20);

/// Call placement seam; the outbound dispatcher talks to this.
#[async_trait]
pub trait CallPlacer: Send + Sync {
    /// Place a call to `to`; the provider will fetch `webhook_url` for
    /// routing instructions when the callee answers. Returns the call sid.
    async fn place_call(&self, to: &str, webhook_url: &str) -> CollabResult<String>;
}

/// REST client against the provider.
pub struct TelephonyClient {
    http: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TelephonyClient {
    pub fn new(config: &TelephonyConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            api_base: config.api_base.clone(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
        }
    }
}

#[derive(Deserialize)]
struct CallResource {
    sid: String,
}

#[async_trait]
impl CallPlacer for TelephonyClient {
    async fn place_call(&self, to: &str, webhook_url: &str) -> CollabResult<String> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.api_base, self.account_sid
        );
        let resource: CallResource = retry_with_deadline(
            "telephony",
            RetryPolicy::default(),
            DISPATCH_DEADLINE,
            || async {
                let resp = self
                    .http
                    .post(&url)
                    .basic_auth(&self.account_sid, Some(&self.auth_token))
                    .form(&[
                        ("To", to),
                        ("From", self.from_number.as_str()),
                        ("Url", webhook_url),
                    ])
                    .send()
                    .await
                    .map_err(|err| CollaboratorError::unavailable("telephony", err.to_string()))?
                    .error_for_status()
                    .map_err(|err| CollaboratorError::unavailable("telephony", err.to_string()))?;
                resp.json()
                    .await
                    .map_err(|err| CollaboratorError::invalid("telephony", err.to_string()))
            },
        )
        .await?;
        info!(to, call_sid = %resource.sid, "outbound call placed");
        Ok(resource.sid)
    }
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Build the stream-connect document a webhook returns: directs the
/// provider to open a bidirectional media stream at `ws_url` and attach
/// `parameters` as stream parameters.
pub fn stream_connect_xml(ws_url: &str, parameters: &[(&str, &str)]) -> String {
    let mut params = String::new();
    for (name, value) in parameters {
        params.push_str(&format!(
            r#"<Parameter name="{}" value="{}"/>"#,
            escape_xml(name),
            escape_xml(value)
        ));
    }
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<Response><Connect><Stream url="{}">{}</Stream></Connect></Response>"#
        ),
        escape_xml(ws_url),
        params
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_document_carries_parameters() {
        let xml = stream_connect_xml(
            "wss://agent.example.com/media",
            &[("From", "+4917260734880"), ("CallSid", "CA123")],
        );
        assert!(xml.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
        assert!(xml.contains(r#"<Stream url="wss://agent.example.com/media">"#));
        assert!(xml.contains(r#"<Parameter name="From" value="+4917260734880"/>"#));
        assert!(xml.contains(r#"<Parameter name="CallSid" value="CA123"/>"#));
    }

    #[test]
    fn xml_special_characters_are_escaped() {
        let xml = stream_connect_xml("wss://x", &[("note", r#"a<b&"c""#)]);
        assert!(xml.contains("a&lt;b&amp;&quot;c&quot;"));
    }
}
