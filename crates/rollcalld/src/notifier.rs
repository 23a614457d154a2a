use crate::config::TwilioConfig;
use base64::Engine;
use rollcall_core::notify::{NotifyError, Notifier};
use std::sync::Arc;
use std::time::Duration;

const TWILIO_API: &str = "https://api.twilio.com/2010-04-01";
const TIMEOUT: Duration = Duration::from_secs(15);

/// Sends SMS through the Twilio Messages REST endpoint.
pub struct TwilioNotifier {
    agent: ureq::Agent,
    url: String,
    authorization: String,
    from: String,
}

impl TwilioNotifier {
    pub fn new(config: &TwilioConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(TIMEOUT)
            .timeout_read(TIMEOUT)
            .timeout_write(TIMEOUT)
            .build();
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", config.account_sid, config.auth_token));
        Self {
            agent,
            url: format!("{TWILIO_API}/Accounts/{}/Messages.json", config.account_sid),
            authorization: format!("Basic {credentials}"),
            from: config.from.clone(),
        }
    }
}

impl Notifier for TwilioNotifier {
    fn notify(&self, address: &str, message: &str) -> Result<(), NotifyError> {
        let response = self
            .agent
            .post(&self.url)
            .set("Authorization", &self.authorization)
            .send_form(&[("To", address), ("From", &self.from), ("Body", message)]);
        match response {
            Ok(_) => {
                tracing::debug!(to = address, "sms sent");
                Ok(())
            }
            Err(ureq::Error::Status(status, resp)) => Err(NotifyError::Rejected {
                status,
                body: resp.into_string().unwrap_or_default(),
            }),
            Err(err) => Err(NotifyError::Transport(err.to_string())),
        }
    }
}

/// Logs messages instead of sending them; used when no SMS gateway is configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, address: &str, message: &str) -> Result<(), NotifyError> {
        tracing::info!(to = address, message, "sms gateway not configured; notification logged only");
        Ok(())
    }
}

pub fn from_config(twilio: Option<&TwilioConfig>) -> Arc<dyn Notifier> {
    match twilio {
        Some(config) => {
            tracing::info!(from = %config.from, "sending guardian notifications via Twilio");
            Arc::new(TwilioNotifier::new(config))
        }
        None => Arc::new(LogNotifier),
    }
}
