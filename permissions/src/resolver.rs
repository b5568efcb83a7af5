//! Resolves a grant request into the users and blobs it affects.

use crate::errors::Result;
use crate::request::PermissionGrantRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::data_model::{DataModelClient, DataModelError};
use shared::session::{Session, SessionFactory};

/// Users holding a permission on one (trial, upload type) pair.
///
/// `None` keys are permissions that span all trials or all assays.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct UserGroup {
    pub trial_id: Option<String>,
    pub upload_type: Option<Vec<String>>,
    pub user_email_list: Vec<String>,
}

/// The users and blobs of one (trial, upload type) pair.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedGrant {
    pub trial_id: Option<String>,
    pub upload_type: Option<Vec<String>>,
    pub user_email_list: Vec<String>,
    pub blob_name_list: Vec<String>,
}

/// Data-model lookups needed to resolve permissions.
#[async_trait]
pub trait PermissionStore: SessionFactory {
    /// Users with permissions matching the trial and upload type, grouped by
    /// the trial and upload type of the matching permission.
    async fn user_emails_for_trial_upload(
        &self,
        session: &Session,
        trial_id: Option<&str>,
        upload_type: Option<&[String]>,
    ) -> Result<Vec<UserGroup>, DataModelError>;

    /// Names of every stored blob for the trial and upload type.
    async fn blob_names(
        &self,
        session: &Session,
        trial_id: Option<&str>,
        upload_type: Option<&[String]>,
    ) -> Result<Vec<String>, DataModelError>;
}

#[derive(Serialize)]
struct Lookup<'a> {
    trial_id: Option<&'a str>,
    upload_type: Option<&'a [String]>,
}

#[async_trait]
impl PermissionStore for DataModelClient {
    async fn user_emails_for_trial_upload(
        &self,
        session: &Session,
        trial_id: Option<&str>,
        upload_type: Option<&[String]>,
    ) -> Result<Vec<UserGroup>, DataModelError> {
        let body = Lookup {
            trial_id,
            upload_type,
        };
        self.call(session, "permissions/user_emails", &body).await
    }

    async fn blob_names(
        &self,
        session: &Session,
        trial_id: Option<&str>,
        upload_type: Option<&[String]>,
    ) -> Result<Vec<String>, DataModelError> {
        let body = Lookup {
            trial_id,
            upload_type,
        };
        self.call(session, "downloadable_files/blob_names", &body)
            .await
    }
}

/// Merges groups that share a (trial, upload type) key, keeping first-seen order.
fn merge_groups(groups: Vec<UserGroup>) -> Vec<UserGroup> {
    let mut merged: Vec<UserGroup> = Vec::with_capacity(groups.len());
    for group in groups {
        match merged
            .iter_mut()
            .find(|g| g.trial_id == group.trial_id && g.upload_type == group.upload_type)
        {
            Some(existing) => {
                for email in group.user_email_list {
                    if !existing.user_email_list.contains(&email) {
                        existing.user_email_list.push(email);
                    }
                }
            }
            None => merged.push(group),
        }
    }
    merged
}

pub struct PermissionResolver<'a> {
    store: &'a dyn PermissionStore,
}

impl<'a> PermissionResolver<'a> {
    pub fn new(store: &'a dyn PermissionStore) -> Self {
        PermissionResolver { store }
    }

    pub async fn resolve(
        &self,
        session: &Session,
        request: &PermissionGrantRequest,
    ) -> Result<Vec<ResolvedGrant>> {
        let groups = match &request.user_email_list {
            Some(users) => vec![UserGroup {
                trial_id: request.trial_id.clone(),
                upload_type: request.upload_type.clone(),
                user_email_list: users.clone(),
            }],
            None => {
                let groups = self
                    .store
                    .user_emails_for_trial_upload(
                        session,
                        request.trial_id.as_deref(),
                        request.upload_type.as_deref(),
                    )
                    .await?;
                merge_groups(groups)
            }
        };

        let mut grants = Vec::with_capacity(groups.len());
        for group in groups {
            let blob_name_list = self
                .store
                .blob_names(session, group.trial_id.as_deref(), group.upload_type.as_deref())
                .await?;

            if group.user_email_list.is_empty() || blob_name_list.is_empty() {
                tracing::debug!(
                    trial_id = ?group.trial_id,
                    upload_type = ?group.upload_type,
                    users = group.user_email_list.len(),
                    blobs = blob_name_list.len(),
                    "Nothing to apply"
                );
                continue;
            }

            grants.push(ResolvedGrant {
                trial_id: group.trial_id,
                upload_type: group.upload_type,
                user_email_list: group.user_email_list,
                blob_name_list,
            });
        }
        Ok(grants)
    }
}
