//! Binds subscribed topics to the functions that handle their messages.

use crate::config::{Config, Topics};
use csms::fetcher::CsmsClient;
use csms::{ReconcileError, Reconciler};
use permissions::acl::{AclError, GcsIamClient};
use permissions::dispatch::ChunkDispatcher;
use permissions::errors::PermissionsError;
use permissions::worker::WorkerError;
use permissions::{GrantHandler, PermissionsWorker};
use shared::data_model::DataModelClient;
use shared::email::RelayNotifier;
use shared::pubsub::{PubSubClient, PubSubMessage};
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Function {
    CsmsUpdate,
    GrantDownloadPermissions,
    Worker,
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Function::CsmsUpdate => "update_cidc_from_csms",
            Function::GrantDownloadPermissions => "grant_download_permissions",
            Function::Worker => "worker",
        };
        f.write_str(name)
    }
}

impl Topics {
    pub fn function_for(&self, topic: &str) -> Option<Function> {
        if topic == self.csms_update {
            Some(Function::CsmsUpdate)
        } else if topic == self.grant_download_permissions {
            Some(Function::GrantDownloadPermissions)
        } else if topic == self.worker {
            Some(Function::Worker)
        } else {
            None
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("no function is subscribed to topic {0}")]
    UnknownTopic(String),
    #[error("{0} is not configured")]
    NotConfigured(Function),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Permissions(#[from] PermissionsError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

pub struct Handlers {
    topics: Topics,
    reconciler: Option<Reconciler>,
    grants: Option<GrantHandler>,
    worker: Option<PermissionsWorker>,
}

impl Handlers {
    pub fn new(
        topics: Topics,
        reconciler: Option<Reconciler>,
        grants: Option<GrantHandler>,
        worker: Option<PermissionsWorker>,
    ) -> Self {
        Handlers {
            topics,
            reconciler,
            grants,
            worker,
        }
    }

    /// Builds every configured function. Clients are created once and shared
    /// by all invocations.
    pub fn from_config(config: &Config) -> Result<Self, AclError> {
        let data_model = Arc::new(DataModelClient::new(
            config.data_model.url.clone(),
            config.data_model.auth.build(),
        ));
        let publisher = Arc::new(PubSubClient::new(
            config.google.pubsub_url.clone(),
            config.google.project.clone(),
            config.google.auth.build(),
        ));
        let notifier = Arc::new(RelayNotifier::new(
            publisher.clone(),
            config.emails.topic.clone(),
        ));

        let reconciler = config.csms.as_ref().map(|csms| {
            let source = Arc::new(CsmsClient::new(
                &csms.api.url,
                csms.api.page_size,
                csms.api.auth.build(),
            ));
            Reconciler::new(
                source,
                data_model.clone(),
                notifier.clone(),
                csms.summary_recipients.clone(),
                csms.uploader_email.clone(),
            )
        });

        let (grants, worker) = match &config.permissions {
            Some(permissions) => {
                let dispatcher = ChunkDispatcher::new(
                    publisher.clone(),
                    permissions.worker_topic.clone(),
                    permissions.blobs_per_chunk,
                    permissions.max_in_flight_publishes,
                );
                let grants = GrantHandler::new(
                    data_model.clone(),
                    dispatcher,
                    notifier.clone(),
                    permissions.alert_recipients.clone(),
                    permissions.env.clone(),
                );
                let acl = GcsIamClient::new(
                    &permissions.acl.storage_url,
                    permissions.acl.bucket.clone(),
                    permissions.acl.role.clone(),
                    permissions.acl.expiry_days,
                    permissions.acl.auth.build(),
                )?;
                (Some(grants), Some(PermissionsWorker::new(Arc::new(acl))))
            }
            None => (None, None),
        };

        Ok(Handlers::new(config.topics.clone(), reconciler, grants, worker))
    }

    pub async fn dispatch(&self, topic: &str, message: &PubSubMessage) -> Result<(), HandlerError> {
        let function = self
            .topics
            .function_for(topic)
            .ok_or_else(|| HandlerError::UnknownTopic(topic.to_string()))?;
        tracing::debug!(%function, message_id = ?message.message_id, "Invoking function");

        match function {
            Function::CsmsUpdate => {
                let reconciler = self
                    .reconciler
                    .as_ref()
                    .ok_or(HandlerError::NotConfigured(function))?;
                reconciler.handle(message).await?;
            }
            Function::GrantDownloadPermissions => {
                let grants = self
                    .grants
                    .as_ref()
                    .ok_or(HandlerError::NotConfigured(function))?;
                grants.handle(message).await?;
            }
            Function::Worker => {
                let worker = self
                    .worker
                    .as_ref()
                    .ok_or(HandlerError::NotConfigured(function))?;
                worker.handle(message).await?;
            }
        }
        Ok(())
    }
}
