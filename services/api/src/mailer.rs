//! SMTP delivery for verification codes.

use anyhow::Context;
use async_trait::async_trait;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::debug;

use crate::config::{SmtpConfig, SmtpTls};

/// Outbound mail capability consumed by the OTP dispatcher.
///
/// Implementations perform exactly one delivery attempt per call; retry
/// policy, if any, belongs to the caller.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver a verification code to `recipient`.
    async fn send_otp(&self, recipient: &str, code: &str) -> anyhow::Result<()>;
}

/// SMTP-backed [`Mailer`] over an async transport.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build the transport from configuration. Does not connect; the
    /// connection is established lazily on first send.
    pub fn new(config: &SmtpConfig) -> anyhow::Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .with_context(|| format!("invalid from mailbox: {}", config.from))?;

        let mut builder = match config.tls {
            SmtpTls::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                    .context("invalid SMTP relay host")?
            }
            SmtpTls::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .context("invalid SMTP relay host")?,
            SmtpTls::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            }
        }
        .port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn build_message(&self, recipient: &str, code: &str) -> anyhow::Result<Message> {
        let to: Mailbox = recipient
            .parse()
            .with_context(|| format!("invalid recipient mailbox: {recipient}"))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject("Your OTP Code")
            .multipart(MultiPart::alternative_plain_html(
                format!("Your OTP is: {code}"),
                format!("<p>Your OTP is: <strong>{code}</strong></p>"),
            ))
            .context("failed to build OTP message")
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_otp(&self, recipient: &str, code: &str) -> anyhow::Result<()> {
        let message = self.build_message(recipient, code)?;
        self.transport
            .send(message)
            .await
            .context("SMTP delivery failed")?;
        debug!(recipient, "OTP email accepted by relay");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmtpConfig;

    fn mailer() -> SmtpMailer {
        SmtpMailer::new(&SmtpConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_message_carries_code_in_both_bodies() {
        let message = mailer().build_message("user@example.com", "482913").unwrap();
        let raw = String::from_utf8_lossy(&message.formatted()).to_string();
        assert!(raw.contains("Subject: Your OTP Code"));
        assert!(raw.contains("Your OTP is: 482913"));
        assert!(raw.contains("<strong>482913</strong>"));
    }

    #[tokio::test]
    async fn test_invalid_recipient_rejected() {
        assert!(mailer().build_message("not-an-email", "123456").is_err());
    }

    #[test]
    fn test_invalid_from_mailbox_rejected() {
        let config = SmtpConfig {
            from: "###".to_string(),
            ..SmtpConfig::default()
        };
        assert!(SmtpMailer::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_transport_builds_for_each_tls_mode() {
        for tls in [SmtpTls::Starttls, SmtpTls::Tls, SmtpTls::None] {
            let config = SmtpConfig {
                tls,
                username: Some("mailer".to_string()),
                password: Some("secret".to_string()),
                ..SmtpConfig::default()
            };
            assert!(SmtpMailer::new(&config).is_ok());
        }
    }
}
