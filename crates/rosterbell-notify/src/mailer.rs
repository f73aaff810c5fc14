//! Mail transport: async SMTP via lettre, plus a log-only fallback.

use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};

use rosterbell_core::config::MailConfig;
use rosterbell_core::error::{Result, RosterbellError};
use rosterbell_core::types::NotificationKind;

/// A rendered message ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMail {
    pub to: String,
    pub to_name: String,
    pub subject: String,
    pub body: String,
    pub kind: NotificationKind,
}

/// What the transport reports back on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendReceipt {
    pub message_id: Option<String>,
}

/// Transport failure, classified for the retry policy.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum MailError {
    /// Worth retrying: connection drops, 4xx replies, timeouts.
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying will not help: bad address, 5xx rejection.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl MailError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, MailError::Permanent(_))
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, mail: &OutgoingMail) -> std::result::Result<SendReceipt, MailError>;
}

// ─── SMTP ─────────────────────────────────────────────────────

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    hostname: String,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_address)
            .parse()
            .map_err(|e| RosterbellError::Mail(format!("Invalid from address: {e}")))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| RosterbellError::Mail(format!("SMTP relay: {e}")))?
            .port(config.smtp_port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        tracing::info!(
            "📮 SMTP mailer: {}:{} as {}",
            config.smtp_host,
            config.smtp_port,
            config.from_address
        );
        Ok(Self {
            transport: builder.build(),
            from,
            hostname,
        })
    }

    fn build_message(
        &self,
        mail: &OutgoingMail,
    ) -> std::result::Result<(LettreMessage, String), MailError> {
        let to: Mailbox = if mail.to_name.is_empty() {
            mail.to.parse()
        } else {
            format!("{} <{}>", mail.to_name, mail.to).parse()
        }
        .map_err(|e| MailError::Permanent(format!("Invalid recipient '{}': {e}", mail.to)))?;

        let message_id = format!("<{}@{}>", uuid::Uuid::new_v4(), self.hostname);
        let message = LettreMessage::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&mail.subject)
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_PLAIN)
            .body(mail.body.clone())
            .map_err(|e| MailError::Permanent(format!("Build email: {e}")))?;
        Ok((message, message_id))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, mail: &OutgoingMail) -> std::result::Result<SendReceipt, MailError> {
        let (message, message_id) = self.build_message(mail)?;
        self.transport.send(message).await.map_err(|e| {
            if e.is_permanent() {
                MailError::Permanent(format!("SMTP send: {e}"))
            } else {
                MailError::Transient(format!("SMTP send: {e}"))
            }
        })?;
        tracing::debug!("📤 Email sent to: {}", mail.to);
        Ok(SendReceipt {
            message_id: Some(message_id),
        })
    }
}

// ─── Log-only ─────────────────────────────────────────────────

/// Used when SMTP is disabled: every message is logged and reported as sent.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, mail: &OutgoingMail) -> std::result::Result<SendReceipt, MailError> {
        tracing::info!(
            "📭 [mail disabled] {} → {} <{}>: {}",
            mail.kind,
            mail.to_name,
            mail.to,
            mail.subject
        );
        Ok(SendReceipt::default())
    }
}

/// Build the mailer the config asks for.
pub fn from_config(config: &MailConfig) -> Result<std::sync::Arc<dyn Mailer>> {
    if config.enabled {
        Ok(std::sync::Arc::new(SmtpMailer::new(config)?))
    } else {
        Ok(std::sync::Arc::new(LogMailer))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn mail(to: &str) -> OutgoingMail {
        OutgoingMail {
            to: to.into(),
            to_name: "Lan".into(),
            subject: "Pending approvals".into(),
            body: "You have 2 pending requests".into(),
            kind: NotificationKind::Reminder,
        }
    }

    fn smtp() -> SmtpMailer {
        let config = MailConfig {
            enabled: true,
            smtp_host: "smtp.acme.test".into(),
            ..MailConfig::default()
        };
        SmtpMailer::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_log_mailer_accepts_everything() {
        let receipt = LogMailer.send(&mail("lan@acme.test")).await.unwrap();
        assert_eq!(receipt.message_id, None);
    }

    #[tokio::test]
    async fn test_build_message_sets_message_id() {
        let m = smtp();
        let (_, id) = m.build_message(&mail("lan@acme.test")).unwrap();
        assert!(id.starts_with('<') && id.ends_with('>'));
        assert!(id.contains('@'));
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_permanent() {
        let m = smtp();
        let err = m.send(&mail("not an address")).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_disabled_config_uses_log_mailer() {
        let mailer = from_config(&MailConfig::default()).unwrap();
        assert_eq!(mailer.name(), "log");
    }
}
