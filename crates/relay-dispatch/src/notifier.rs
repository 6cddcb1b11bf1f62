//! Operator alerts for failed store passes
//!
//! Sending is best effort: a failure to notify is logged and never affects
//! the dispatch loop.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::{error, info};

use crate::error::{NotifyError, StorePassError};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_store_failure(&self, error: &StorePassError);

    fn is_enabled(&self) -> bool;
}

/// Used when no recipients are configured
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn notify_store_failure(&self, _error: &StorePassError) {}

    fn is_enabled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct SmtpNotifierConfig {
    /// e.g. `smtp://localhost:25`
    pub smtp_url: String,
    pub from: String,
    pub recipients: Vec<String>,
    pub subject: String,
}

/// Emails the failure trace to every configured recipient
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
    subject: String,
}

impl SmtpNotifier {
    pub fn new(config: SmtpNotifierConfig) -> Result<Self, NotifyError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::from_url(&config.smtp_url)?.build();
        let from: Mailbox = config.from.parse()?;
        let recipients = config
            .recipients
            .iter()
            .map(|r| r.parse::<Mailbox>())
            .collect::<Result<Vec<_>, _>>()?;

        info!(recipients = recipients.len(), "SMTP failure notifications enabled");

        Ok(Self {
            transport,
            from,
            recipients,
            subject: config.subject,
        })
    }

    pub(crate) fn build_email(&self, failure: &StorePassError) -> Result<lettre::Message, NotifyError> {
        let mut builder = lettre::Message::builder()
            .from(self.from.clone())
            .subject(self.subject.clone())
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }

        let body = format!("Store: {}\n\n{}\n", failure.store, failure.trace());
        Ok(builder.body(body)?)
    }

    async fn send(&self, failure: &StorePassError) -> Result<(), NotifyError> {
        let email = self.build_email(failure)?;
        self.transport.send(email).await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify_store_failure(&self, failure: &StorePassError) {
        match self.send(failure).await {
            Ok(()) => info!(store = %failure.store, "Failure notification sent"),
            Err(e) => error!(store = %failure.store, error = %e, "Failed to send failure notification"),
        }
    }

    fn is_enabled(&self) -> bool {
        !self.recipients.is_empty()
    }
}
