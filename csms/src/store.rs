use crate::manifest::Manifest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::data_model::{DataModelClient, DataModelError};
use shared::session::{Session, SessionFactory};
use std::collections::BTreeMap;
use std::fmt;

/// A single field-level difference between a CSMS manifest and the stored copy.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Change {
    pub entity_type: String,
    pub manifest_id: String,
    pub trial_id: String,
    pub record_id: String,
    /// Field name to `[old, new]`.
    pub changes: BTreeMap<String, (Value, Value)>,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} in {} manifest {}:",
            self.entity_type, self.record_id, self.trial_id, self.manifest_id
        )?;
        for (field, (old, new)) in &self.changes {
            write!(f, " {field} {old} -> {new};")?;
        }
        Ok(())
    }
}

/// What the data model knows about a manifest compared to CSMS.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "outcome", content = "changes", rename_all = "snake_case")]
pub enum ChangeOutcome {
    Unchanged,
    Changed(Vec<Change>),
    /// The manifest has never been loaded.
    New,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    DataModel(#[from] DataModelError),
    #[error("{0}")]
    Rejected(String),
}

/// The data-model operations reconciliation relies on.
#[async_trait]
pub trait ManifestStore: SessionFactory {
    async fn detect_manifest_changes(
        &self,
        session: &Session,
        manifest: &Manifest,
        uploader_email: &str,
    ) -> Result<ChangeOutcome, StoreError>;

    /// Loads a new manifest into the trial metadata blob.
    async fn insert_manifest(
        &self,
        session: &Session,
        manifest: &Manifest,
        uploader_email: &str,
    ) -> Result<(), StoreError>;
}

#[derive(Serialize)]
struct ManifestCall<'a> {
    manifest: &'a Manifest,
    uploader_email: &'a str,
}

#[async_trait]
impl ManifestStore for DataModelClient {
    async fn detect_manifest_changes(
        &self,
        session: &Session,
        manifest: &Manifest,
        uploader_email: &str,
    ) -> Result<ChangeOutcome, StoreError> {
        let body = ManifestCall {
            manifest,
            uploader_email,
        };
        Ok(self
            .call(session, "csms/manifests/detect_changes", &body)
            .await?)
    }

    async fn insert_manifest(
        &self,
        session: &Session,
        manifest: &Manifest,
        uploader_email: &str,
    ) -> Result<(), StoreError> {
        let body = ManifestCall {
            manifest,
            uploader_email,
        };
        let _: Value = self.call(session, "csms/manifests/insert", &body).await?;
        Ok(())
    }
}
