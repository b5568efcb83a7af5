use serde::Deserialize;
use shared::auth::TokenConfig;
use url::Url;

fn default_page_size() -> usize {
    5000
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Api {
    pub url: Url,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    pub auth: TokenConfig,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub api: Api,
    /// Recipients of the per-run summary email.
    pub summary_recipients: Vec<String>,
    /// Recorded as the uploader of manifests loaded from CSMS.
    #[serde(default)]
    pub uploader_email: String,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("csms page size cannot be 0")]
    ZeroPageSize,
    #[error("csms summary recipients cannot be empty")]
    NoRecipients,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.api.page_size == 0 {
            return Err(ValidationError::ZeroPageSize);
        }
        if self.summary_recipients.is_empty() {
            return Err(ValidationError::NoRecipients);
        }
        Ok(())
    }
}
