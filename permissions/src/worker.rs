//! Consumer of the worker topic.

use crate::acl::{AclError, AclManager};
use crate::dispatch::{WorkBatch, WorkerTask};
use crate::metrics_defs::WORKER_BATCHES;
use serde_json::{Map, Value};
use shared::counter;
use shared::pubsub::{EnvelopeError, PubSubMessage};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("could not decode worker message: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("worker message is not a JSON object: {0}")]
    InvalidPayload(String),
    #[error("fn must be provided to pass remaining arguments, got {0:?}")]
    UnknownFunction(String),
    #[error(
        "user_email_list and blob_name_list must both be provided, got {users} users and {blobs} blobs"
    )]
    EmptyBatch { users: usize, blobs: usize },
    #[error(transparent)]
    Acl(#[from] AclError),
}

/// Decodes a worker message into the task it names.
pub fn parse_task(payload: &str) -> Result<WorkerTask, WorkerError> {
    let raw: Map<String, Value> =
        serde_json::from_str(payload).map_err(|e| WorkerError::InvalidPayload(e.to_string()))?;

    match raw.get("_fn").and_then(Value::as_str) {
        Some("permissions_worker") => {}
        Some(other) => return Err(WorkerError::UnknownFunction(other.to_string())),
        None => return Err(WorkerError::UnknownFunction(String::new())),
    }

    serde_json::from_value(Value::Object(raw)).map_err(|e| WorkerError::InvalidPayload(e.to_string()))
}

pub struct PermissionsWorker {
    acl: Arc<dyn AclManager>,
}

impl PermissionsWorker {
    pub fn new(acl: Arc<dyn AclManager>) -> Self {
        PermissionsWorker { acl }
    }

    pub async fn handle(&self, message: &PubSubMessage) -> Result<(), WorkerError> {
        match parse_task(&message.decode_data()?)? {
            WorkerTask::PermissionsWorker(batch) => self.apply(&batch).await,
        }
    }

    /// Applies one batch with a single ACL call. Errors are not retried here;
    /// the transport redelivers the message.
    pub async fn apply(&self, batch: &WorkBatch) -> Result<(), WorkerError> {
        if batch.user_email_list.is_empty() || batch.blob_name_list.is_empty() {
            return Err(WorkerError::EmptyBatch {
                users: batch.user_email_list.len(),
                blobs: batch.blob_name_list.len(),
            });
        }

        let action = if batch.revoke { "revoke" } else { "grant" };
        let result = if batch.revoke {
            self.acl
                .revoke(&batch.user_email_list, &batch.blob_name_list)
                .await
        } else {
            self.acl
                .grant(&batch.user_email_list, &batch.blob_name_list)
                .await
        };

        if let Err(e) = &result {
            tracing::error!(
                action,
                users = ?batch.user_email_list,
                blobs = batch.blob_name_list.len(),
                error = %e,
                "ACL update failed"
            );
        }
        counter!(WORKER_BATCHES, "action" => action, "success" => if result.is_ok() { "true" } else { "false" })
            .increment(1);
        Ok(result?)
    }
}
