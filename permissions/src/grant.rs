use crate::dispatch::ChunkDispatcher;
use crate::errors::{PermissionsError, Result};
use crate::metrics_defs::GRANT_REQUESTS;
use crate::request::PermissionGrantRequest;
use crate::resolver::{PermissionResolver, PermissionStore};
use shared::counter;
use shared::email::{Email, Notifier};
use shared::pubsub::PubSubMessage;
use shared::session::scoped;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// What a grant request fanned out to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GrantReport {
    pub pairs: usize,
    pub messages: usize,
}

/// Handles `grant_download_permissions` requests: resolves the affected users
/// and blobs, then hands the work to the worker topic in chunks.
pub struct GrantHandler {
    store: Arc<dyn PermissionStore>,
    dispatcher: ChunkDispatcher,
    notifier: Arc<dyn Notifier>,
    alert_recipients: Vec<String>,
    env: String,
}

impl GrantHandler {
    pub fn new(
        store: Arc<dyn PermissionStore>,
        dispatcher: ChunkDispatcher,
        notifier: Arc<dyn Notifier>,
        alert_recipients: Vec<String>,
        env: String,
    ) -> Self {
        GrantHandler {
            store,
            dispatcher,
            notifier,
            alert_recipients,
            env,
        }
    }

    pub async fn handle(&self, message: &PubSubMessage) -> Result<GrantReport> {
        let request = PermissionGrantRequest::parse(&message.decode_data()?)?;
        self.grant(&request).await
    }

    pub async fn grant(&self, request: &PermissionGrantRequest) -> Result<GrantReport> {
        let result = scoped(self.store.as_ref(), |session| async move {
            let grants = PermissionResolver::new(self.store.as_ref())
                .resolve(&session, request)
                .await?;

            let mut report = GrantReport::default();
            for grant in &grants {
                report.messages += self
                    .dispatcher
                    .dispatch(&grant.user_email_list, &grant.blob_name_list, request.revoke)
                    .await?;
                report.pairs += 1;
                tracing::info!(
                    trial_id = ?grant.trial_id,
                    upload_type = ?grant.upload_type,
                    users = grant.user_email_list.len(),
                    blobs = grant.blob_name_list.len(),
                    revoke = request.revoke,
                    "Dispatched permission changes"
                );
            }
            Ok::<_, PermissionsError>(report)
        })
        .await;

        match &result {
            Ok(report) => {
                counter!(GRANT_REQUESTS, "outcome" => "success").increment(1);
                tracing::info!(pairs = report.pairs, messages = report.messages, "Grant request done");
            }
            Err(e) => {
                counter!(GRANT_REQUESTS, "outcome" => "error").increment(1);
                tracing::error!(error = %e, %request, "Error granting permissions");
                self.alert(e, request).await;
            }
        }
        result
    }

    async fn alert(&self, error: &PermissionsError, request: &PermissionGrantRequest) {
        let now = OffsetDateTime::now_utc();
        let timestamp = now.format(&Rfc3339).unwrap_or_else(|_| now.to_string());
        let email = Email {
            to_emails: self.alert_recipients.clone(),
            subject: format!(
                "[DEV ALERT]({}) Error granting permissions: {timestamp}",
                self.env
            ),
            html_content: format!("See logs for more info<br />{error}<br />For {request}"),
        };
        if let Err(e) = self.notifier.send(email).await {
            tracing::error!(error = %e, "Failed to send permissions alert");
        }
    }
}
