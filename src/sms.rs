//! SMS collaborator
//!
//! Used for exactly one thing: telling the teammate what their customer
//! chose after the outbound verification leg ends.

use async_trait::async_trait;
use tracing::info;

use crate::backoff::{retry_with_deadline, RetryPolicy};
use crate::config::TelephonyConfig;
use crate::error::{CollabResult, CollaboratorError};

/// SMS seam.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> CollabResult<()>;
}

/// Sends through the telephony provider's messaging endpoint.
pub struct ProviderSms {
    http: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl ProviderSms {
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

#[async_trait]
impl SmsSender for ProviderSms {
    async fn send(&self, to: &str, body: &str) -> CollabResult<()> {
        if !crate::types::is_e164(to) {
            return Err(CollaboratorError::invalid("sms", format!("not E.164: {to}")));
        }
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        );
        retry_with_deadline(
            "sms",
            RetryPolicy::default(),
            std::time::Duration::from_secs(10),
            || async {
                self.http
                    .post(&url)
                    .basic_auth(&self.account_sid, Some(&self.auth_token))
                    .form(&[("To", to), ("From", self.from_number.as_str()), ("Body", body)])
                    .send()
                    .await
                    .map_err(|err| CollaboratorError::unavailable("sms", err.to_string()))?
                    .error_for_status()
                    .map_err(|err| CollaboratorError::unavailable("sms", err.to_string()))?;
                Ok(())
            },
        )
        .await?;
        info!(to, "sms sent");
        Ok(())
    }
}
