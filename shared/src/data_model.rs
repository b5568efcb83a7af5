//! HTTP facade of the data-model service.
//!
//! The data model (manifest change detection, permissions, downloadable files)
//! is owned by an external service. Every call made on behalf of a handler
//! invocation carries the id of the session opened for that invocation, so the
//! service can commit or roll back the invocation's writes as one unit.

use crate::auth::{AuthError, TokenSource};
use crate::session::{Session, SessionError, SessionFactory};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use url::Url;

pub const SESSION_HEADER: &str = "X-Session-Id";

#[derive(thiserror::Error, Debug)]
pub enum DataModelError {
    #[error("data model request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("could not authorize data model request: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid data model URL: {0}")]
    InvalidUrl(String),
    #[error("{path} returned {status}: {message}")]
    Status {
        path: String,
        status: StatusCode,
        message: String,
    },
}

#[derive(serde::Deserialize)]
struct OpenedSession {
    session_id: String,
}

pub struct DataModelClient {
    client: reqwest::Client,
    base_url: Url,
    tokens: Arc<dyn TokenSource>,
}

impl DataModelClient {
    pub fn new(base_url: Url, tokens: Arc<dyn TokenSource>) -> Self {
        DataModelClient {
            client: reqwest::Client::new(),
            base_url,
            tokens,
        }
    }

    /// Appends `path` to the base URL whether or not it ends in a slash.
    fn url(&self, path: &str) -> Result<Url, DataModelError> {
        let full_url = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&full_url).map_err(|e| DataModelError::InvalidUrl(e.to_string()))
    }

    async fn post(
        &self,
        path: &str,
        session: Option<&Session>,
        body: &(impl Serialize + Sync),
    ) -> Result<reqwest::Response, DataModelError> {
        let token = self.tokens.token().await?;
        let mut request = self
            .client
            .post(self.url(path)?)
            .bearer_auth(token)
            .json(body);
        if let Some(session) = session {
            request = request.header(SESSION_HEADER, session.id());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DataModelError::Status {
                path: path.to_string(),
                status,
                message,
            });
        }
        Ok(response)
    }

    /// Calls a data-model operation within `session` and decodes its JSON result.
    pub async fn call<Req, Resp>(
        &self,
        session: &Session,
        path: &str,
        body: &Req,
    ) -> Result<Resp, DataModelError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self.post(path, Some(session), body).await?;
        Ok(response.json::<Resp>().await?)
    }
}

#[async_trait]
impl SessionFactory for DataModelClient {
    async fn begin(&self) -> Result<Session, SessionError> {
        let response = self
            .post("sessions", None, &serde_json::json!({}))
            .await
            .map_err(|e| SessionError::Begin(e.to_string()))?;
        let opened = response
            .json::<OpenedSession>()
            .await
            .map_err(|e| SessionError::Begin(e.to_string()))?;
        Ok(Session::new(opened.session_id))
    }

    async fn commit(&self, session: Session) -> Result<(), SessionError> {
        let path = format!("sessions/{}/commit", session.id());
        self.post(&path, Some(&session), &serde_json::json!({}))
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Commit {
                id: session.id().to_string(),
                reason: e.to_string(),
            })
    }

    async fn rollback(&self, session: Session) -> Result<(), SessionError> {
        let path = format!("sessions/{}/rollback", session.id());
        self.post(&path, Some(&session), &serde_json::json!({}))
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Rollback {
                id: session.id().to_string(),
                reason: e.to_string(),
            })
    }
}
