use crate::pubsub::{PublishError, Publisher};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An outbound email as understood by the email relay function.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Email {
    pub to_emails: Vec<String>,
    pub subject: String,
    pub html_content: String,
}

#[derive(thiserror::Error, Debug)]
pub enum NotifyError {
    #[error("no recipients configured")]
    NoRecipients,
    #[error("could not hand email to the relay: {0}")]
    Publish(#[from] PublishError),
    #[error("could not encode email: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, email: Email) -> Result<(), NotifyError>;
}

/// Hands emails to the relay by publishing them on the emails topic.
pub struct RelayNotifier {
    publisher: Arc<dyn Publisher>,
    topic: String,
}

impl RelayNotifier {
    pub fn new(publisher: Arc<dyn Publisher>, topic: String) -> Self {
        RelayNotifier { publisher, topic }
    }
}

#[async_trait]
impl Notifier for RelayNotifier {
    async fn send(&self, email: Email) -> Result<(), NotifyError> {
        if email.to_emails.is_empty() {
            return Err(NotifyError::NoRecipients);
        }

        let payload = serde_json::to_vec(&email)?;
        let message_id = self.publisher.publish(&self.topic, payload).await?;
        tracing::info!(
            subject = %email.subject,
            recipients = email.to_emails.len(),
            message_id = %message_id,
            "Queued email"
        );
        Ok(())
    }
}
