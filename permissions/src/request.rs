//! Decoding of `grant_download_permissions` requests.

use crate::errors::{PermissionsError, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;

/// `upload_type` as sent by callers: a single type or a list of types.
#[derive(Deserialize)]
#[serde(untagged)]
enum UploadTypeField {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct RawRequest {
    trial_id: Option<String>,
    upload_type: Option<UploadTypeField>,
    #[serde(default)]
    revoke: Option<bool>,
    #[serde(default)]
    user_email_list: Option<Vec<String>>,
}

/// A validated permission grant (or revoke) request.
///
/// `None` for `trial_id` or `upload_type` means cross-trial or cross-assay.
#[derive(Clone, Debug, PartialEq)]
pub struct PermissionGrantRequest {
    pub trial_id: Option<String>,
    pub upload_type: Option<Vec<String>>,
    pub revoke: bool,
    pub user_email_list: Option<Vec<String>>,
    raw: Map<String, Value>,
}

impl PermissionGrantRequest {
    /// Parses a decoded payload. Both `trial_id` and `upload_type` must be
    /// present, though either may be null.
    pub fn parse(payload: &str) -> Result<Self> {
        let raw: Map<String, Value> = serde_json::from_str(payload)
            .map_err(|e| PermissionsError::InvalidRequest(e.to_string()))?;

        if !raw.contains_key("trial_id") || !raw.contains_key("upload_type") {
            return Err(PermissionsError::MissingKeys {
                provided: Value::Object(raw).to_string(),
            });
        }

        let parsed: RawRequest = serde_json::from_value(Value::Object(raw.clone()))
            .map_err(|e| PermissionsError::InvalidRequest(e.to_string()))?;

        let upload_type = match parsed.upload_type {
            Some(UploadTypeField::One(value)) if !value.is_empty() => Some(vec![value]),
            Some(UploadTypeField::Many(values)) if !values.is_empty() => Some(values),
            _ => None,
        };

        Ok(PermissionGrantRequest {
            trial_id: parsed.trial_id,
            upload_type,
            revoke: parsed.revoke.unwrap_or(false),
            user_email_list: parsed.user_email_list.filter(|users| !users.is_empty()),
            raw,
        })
    }
}

impl fmt::Display for PermissionGrantRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.raw.clone()))
    }
}
