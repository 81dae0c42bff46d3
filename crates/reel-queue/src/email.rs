//! The `email` job kind

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::HandlerError;
use crate::registry::{JobContext, JobHandler, JobPayload, TypedPayload};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailPayload {
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl EmailPayload {
    pub fn new(to: Vec<String>, subject: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to,
            subject: subject.into(),
            text: text.into(),
            from_display_name: None,
            reply_to: None,
        }
    }
}

impl JobPayload for EmailPayload {
    fn validate(&self) -> Result<(), String> {
        if self.to.is_empty() {
            return Err("at least one recipient is required".into());
        }
        if let Some(bad) = self.to.iter().find(|addr| !addr.contains('@')) {
            return Err(format!("invalid recipient address `{bad}`"));
        }
        if let Some(reply_to) = self.reply_to.as_deref().filter(|addr| !addr.contains('@')) {
            return Err(format!("invalid reply-to address `{reply_to}`"));
        }
        if self.subject.trim().is_empty() {
            return Err("subject must not be empty".into());
        }
        Ok(())
    }
}

impl TypedPayload for EmailPayload {
    const KIND: &'static str = "email";
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailError {
    /// The transport could not be reached or timed out
    #[error("Mail transport error: {0}")]
    Transport(String),
    /// The transport refused the message, e.g. an invalid recipient
    #[error("Mail rejected: {0}")]
    Rejected(String),
}

impl From<MailError> for HandlerError {
    fn from(error: MailError) -> Self {
        match error {
            MailError::Transport(_) => HandlerError::transient(error),
            MailError::Rejected(_) => HandlerError::terminal(error),
        }
    }
}

/// The outbound mail capability
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send_mail(&self, email: &EmailPayload) -> Result<(), MailError>;
}

/// Hands email jobs to a [`Mailer`]
#[derive(Debug, Clone)]
pub struct EmailHandler<M> {
    mailer: M,
}

impl<M: Mailer> EmailHandler<M> {
    pub fn new(mailer: M) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl<M: Mailer> JobHandler for EmailHandler<M> {
    type Payload = EmailPayload;

    async fn handle(&self, payload: EmailPayload, ctx: JobContext) -> Result<(), HandlerError> {
        info!(job.id = ctx.id, attempt = ctx.attempt, "Processing email");
        self.mailer.send_mail(&payload).await?;
        Ok(())
    }
}

/// Development mailer: logs instead of sending
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_mail(&self, email: &EmailPayload) -> Result<(), MailError> {
        info!(
            to = ?email.to,
            subject = %email.subject,
            from = email.from_display_name.as_deref().unwrap_or_default(),
            "Email not sent, log mailer in use"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingMailer {
        sent: Arc<Mutex<Vec<EmailPayload>>>,
        fail_with: Option<MailError>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send_mail(&self, email: &EmailPayload) -> Result<(), MailError> {
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    fn ctx() -> JobContext {
        JobContext {
            id: 3,
            kind: EmailPayload::KIND.into(),
            attempt: 1,
            max_attempts: 5,
        }
    }

    fn email() -> EmailPayload {
        EmailPayload::new(vec!["a@example.com".into()], "Hi", "Body")
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let payload: EmailPayload = serde_json::from_value(json!({
            "to": ["a@example.com"],
            "subject": "Hi",
            "text": "Body",
            "fromDisplayName": "Reel",
            "replyTo": "admin@example.com"
        }))
        .unwrap();
        assert_eq!(payload.from_display_name.as_deref(), Some("Reel"));
        assert_eq!(payload.reply_to.as_deref(), Some("admin@example.com"));

        let value = serde_json::to_value(email()).unwrap();
        assert_eq!(value, json!({"to": ["a@example.com"], "subject": "Hi", "text": "Body"}));
    }

    #[test]
    fn test_validation() {
        assert!(email().validate().is_ok());

        let mut no_recipients = email();
        no_recipients.to.clear();
        assert!(no_recipients.validate().is_err());

        let mut bad_recipient = email();
        bad_recipient.to.push("nobody".into());
        assert!(bad_recipient.validate().unwrap_err().contains("nobody"));

        let mut bad_reply_to = email();
        bad_reply_to.reply_to = Some("nowhere".into());
        assert!(bad_reply_to.validate().is_err());

        let mut blank_subject = email();
        blank_subject.subject = "  ".into();
        assert!(blank_subject.validate().is_err());
    }

    #[tokio::test]
    async fn test_handler_sends_mail() {
        let mailer = RecordingMailer::default();
        let handler = EmailHandler::new(mailer.clone());

        handler.handle(email(), ctx()).await.unwrap();
        assert_eq!(mailer.sent.lock().unwrap().as_slice(), &[email()]);
    }

    #[tokio::test]
    async fn test_mail_errors_map_to_retryability() {
        let transport = EmailHandler::new(RecordingMailer {
            fail_with: Some(MailError::Transport("connection refused".into())),
            ..Default::default()
        });
        assert!(matches!(
            transport.handle(email(), ctx()).await,
            Err(HandlerError::Transient(_))
        ));

        let rejected = EmailHandler::new(RecordingMailer {
            fail_with: Some(MailError::Rejected("550 no such user".into())),
            ..Default::default()
        });
        assert_eq!(
            rejected.handle(email(), ctx()).await,
            Err(HandlerError::Terminal("Mail rejected: 550 no such user".into()))
        );
    }

    #[tokio::test]
    async fn test_log_mailer() {
        assert!(LogMailer.send_mail(&email()).await.is_ok());
    }
}
