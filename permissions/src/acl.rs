//! Download access to stored blobs through conditional bucket IAM bindings.
//!
//! Each blob prefix gets at most one binding: the configured role, one
//! `user:` member per grantee and a condition that limits the binding to
//! objects under the prefix until an expiry date. The bucket policy is updated
//! by read-modify-write; the write carries the etag that was read, so a
//! concurrent update makes the write fail with 412 and the update is redone
//! on a fresh copy of the policy.

const MAX_ATTEMPTS: u32 = 3;
const POLICY_VERSION: u32 = 3;

use crate::metrics_defs::{ACL_CONFLICTS, ACL_UPDATES};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::auth::{AuthError, TokenSource};
use shared::counter;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum AclError {
    #[error("IAM request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("could not authorize IAM request: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("IAM API returned status {0}")]
    BadStatus(StatusCode),
    #[error("bucket policy kept changing, gave up after {0} attempts")]
    Conflict(u32),
    #[error("could not format expiry: {0}")]
    Expiry(#[from] time::error::Format),
}

/// Grants and revokes download access to blobs.
#[async_trait]
pub trait AclManager: Send + Sync {
    async fn grant(&self, users: &[String], blobs: &[String]) -> Result<(), AclError>;
    async fn revoke(&self, users: &[String], blobs: &[String]) -> Result<(), AclError>;
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Condition {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub expression: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Binding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Binding {
    fn is_for(&self, role: &str, prefix: &str) -> bool {
        self.role == role
            && self
                .condition
                .as_ref()
                .is_some_and(|condition| condition.title == prefix)
    }
}

/// A bucket IAM policy. Fields this module does not touch are kept as read.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct IamPolicy {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn member(email: &str) -> String {
    format!("user:{email}")
}

fn prefix_expression(bucket: &str, prefix: &str, expiry: &str) -> String {
    format!(
        r#"resource.name.startsWith("projects/_/buckets/{bucket}/objects/{prefix}") && request.time < timestamp("{expiry}")"#
    )
}

impl IamPolicy {
    /// Adds `users` to the binding of every prefix in `blobs`, creating
    /// bindings as needed. Existing bindings get the new expiry.
    pub fn grant(&mut self, role: &str, bucket: &str, users: &[String], blobs: &[String], expiry: &str) {
        self.version = POLICY_VERSION;
        for prefix in blobs {
            let condition = Condition {
                title: prefix.clone(),
                description: String::new(),
                expression: prefix_expression(bucket, prefix, expiry),
            };

            match self.bindings.iter_mut().find(|b| b.is_for(role, prefix)) {
                Some(binding) => {
                    for user in users {
                        let user = member(user);
                        if !binding.members.contains(&user) {
                            binding.members.push(user);
                        }
                    }
                    binding.condition = Some(condition);
                }
                None => self.bindings.push(Binding {
                    role: role.to_string(),
                    members: users.iter().map(|u| member(u)).collect(),
                    condition: Some(condition),
                }),
            }
        }
    }

    /// Removes `users` from the binding of every prefix in `blobs`. Bindings
    /// left without members are dropped.
    pub fn revoke(&mut self, role: &str, users: &[String], blobs: &[String]) {
        self.version = POLICY_VERSION;
        let removed: Vec<String> = users.iter().map(|u| member(u)).collect();
        for prefix in blobs {
            for binding in self.bindings.iter_mut().filter(|b| b.is_for(role, prefix)) {
                binding.members.retain(|m| !removed.contains(m));
            }
        }
        self.bindings
            .retain(|b| !(b.members.is_empty() && blobs.iter().any(|p| b.is_for(role, p))));
    }
}

/// Bucket IAM through the Cloud Storage JSON API.
pub struct GcsIamClient {
    client: reqwest::Client,
    policy_url: Url,
    bucket: String,
    role: String,
    expiry_days: i64,
    tokens: Arc<dyn TokenSource>,
}

impl GcsIamClient {
    pub fn new(
        storage_url: &Url,
        bucket: String,
        role: String,
        expiry_days: i64,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, AclError> {
        let policy_url = Url::parse(&format!(
            "{}/storage/v1/b/{bucket}/iam",
            storage_url.as_str().trim_end_matches('/')
        ))
        .map_err(|e| AclError::InvalidUrl(e.to_string()))?;

        Ok(GcsIamClient {
            client: reqwest::Client::new(),
            policy_url,
            bucket,
            role,
            expiry_days,
            tokens,
        })
    }

    /// Expiry for new grants: midnight UTC, `expiry_days` from today.
    fn expiry(&self) -> Result<String, AclError> {
        let expires = (OffsetDateTime::now_utc() + Duration::days(self.expiry_days))
            .date()
            .midnight()
            .assume_utc();
        Ok(expires.format(&Rfc3339)?)
    }

    async fn get_policy(&self) -> Result<IamPolicy, AclError> {
        let token = self.tokens.token().await?;
        let response = self
            .client
            .get(self.policy_url.clone())
            .query(&[("optionsRequestedPolicyVersion", POLICY_VERSION)])
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AclError::BadStatus(response.status()));
        }
        Ok(response.json::<IamPolicy>().await?)
    }

    /// Returns false if the policy changed since it was read.
    async fn set_policy(&self, policy: &IamPolicy) -> Result<bool, AclError> {
        let token = self.tokens.token().await?;
        let response = self
            .client
            .put(self.policy_url.clone())
            .bearer_auth(token)
            .json(policy)
            .send()
            .await?;
        match response.status() {
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(AclError::BadStatus(status)),
        }
    }

    async fn update<F>(&self, action: &'static str, apply: F) -> Result<(), AclError>
    where
        F: Fn(&mut IamPolicy) + Send + Sync,
    {
        for attempt in 1..=MAX_ATTEMPTS {
            let mut policy = self.get_policy().await?;
            apply(&mut policy);
            if self.set_policy(&policy).await? {
                counter!(ACL_UPDATES, "action" => action).increment(1);
                return Ok(());
            }
            counter!(ACL_CONFLICTS).increment(1);
            tracing::warn!(bucket = %self.bucket, attempt, "Bucket policy changed during update");
        }
        Err(AclError::Conflict(MAX_ATTEMPTS))
    }
}

#[async_trait]
impl AclManager for GcsIamClient {
    async fn grant(&self, users: &[String], blobs: &[String]) -> Result<(), AclError> {
        let expiry = self.expiry()?;
        self.update("grant", |policy| {
            policy.grant(&self.role, &self.bucket, users, blobs, &expiry)
        })
        .await?;
        tracing::info!(users = users.len(), blobs = blobs.len(), %expiry, "Granted download access");
        Ok(())
    }

    async fn revoke(&self, users: &[String], blobs: &[String]) -> Result<(), AclError> {
        self.update("revoke", |policy| policy.revoke(&self.role, users, blobs))
            .await?;
        tracing::info!(users = users.len(), blobs = blobs.len(), "Revoked download access");
        Ok(())
    }
}
