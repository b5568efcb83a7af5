use crate::dispatch::DispatchError;
use shared::data_model::DataModelError;
use shared::pubsub::EnvelopeError;
use shared::session::SessionError;
use thiserror::Error;

/// Result type alias for permission grant operations
pub type Result<T, E = PermissionsError> = std::result::Result<T, E>;

/// Errors that can occur while granting or revoking download permissions
#[derive(Error, Debug)]
pub enum PermissionsError {
    #[error("could not decode request: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("request is not a JSON object: {0}")]
    InvalidRequest(String),

    #[error(
        "trial_id and upload_type must both be provided, you provided: {provided}. \
         Provide null for cross-trial/assay matching"
    )]
    MissingKeys { provided: String },

    #[error("data model error: {0}")]
    Store(#[from] DataModelError),

    #[error("store session error: {0}")]
    Session(#[from] SessionError),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}
