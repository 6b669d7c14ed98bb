//! Verification-code delivery — a `send(email, code)` contract with a
//! logging stub as the default and an SMTP sender over lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::MailerError;

/// Delivery channel for verification codes.
#[async_trait]
pub trait CodeMailer: Send + Sync {
    /// Deliver `code` to `email`.
    async fn send_code(&self, email: &str, code: &str) -> Result<(), MailerError>;
}

/// Logging stub — the default mailer. Real delivery is out of scope for
/// this service, so the code is written to the log where operators (and
/// tests) can pick it up.
pub struct LogMailer;

#[async_trait]
impl CodeMailer for LogMailer {
    async fn send_code(&self, email: &str, code: &str) -> Result<(), MailerError> {
        info!(email = %email, code = %code, "Verification code issued (log delivery)");
        Ok(())
    }
}

/// SMTP configuration for the lettre-backed mailer.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

/// Sends verification codes over SMTP.
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn build_message(&self, to: &str, code: &str) -> Result<Message, MailerError> {
        Message::builder()
            .from(self.config.from_address.parse().map_err(|e| MailerError::Build {
                email: to.into(),
                reason: format!("Invalid from address: {e}"),
            })?)
            .to(to.parse().map_err(|e| MailerError::Build {
                email: to.into(),
                reason: format!("Invalid to address: {e}"),
            })?)
            .subject("Your clinic registration verification code")
            .body(format!(
                "Your verification code is {code}.\n\n\
                 Enter it on the registration page to confirm your email address.\n\
                 The code expires with your registration."
            ))
            .map_err(|e| MailerError::Build {
                email: to.into(),
                reason: format!("Failed to build email: {e}"),
            })
    }
}

#[async_trait]
impl CodeMailer for SmtpMailer {
    async fn send_code(&self, email: &str, code: &str) -> Result<(), MailerError> {
        let message = self.build_message(email, code)?;

        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::relay(&self.config.host)
            .map_err(|e| MailerError::Send {
                email: email.into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(self.config.port)
            .credentials(creds)
            .build();

        // lettre's SmtpTransport is blocking; keep it off the async runtime.
        let to = email.to_string();
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| MailerError::Send {
                email: to.clone(),
                reason: format!("Send task failed: {e}"),
            })?
            .map_err(|e| MailerError::Send {
                email: to.clone(),
                reason: format!("SMTP send failed: {e}"),
            })?;

        info!(email = %email, "Verification code sent");
        Ok(())
    }
}
