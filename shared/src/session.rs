//! Invocation-scoped metadata store sessions.
//!
//! A session is acquired when a handler starts, committed when its body
//! finishes cleanly and rolled back when it fails. Sessions never outlive the
//! invocation that opened them.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Handle to an open store session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Session {
    id: Arc<str>,
}

impl Session {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Session { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("could not open session: {0}")]
    Begin(String),
    #[error("could not commit session {id}: {reason}")]
    Commit { id: String, reason: String },
    #[error("could not roll back session {id}: {reason}")]
    Rollback { id: String, reason: String },
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn begin(&self) -> Result<Session, SessionError>;
    async fn commit(&self, session: Session) -> Result<(), SessionError>;
    async fn rollback(&self, session: Session) -> Result<(), SessionError>;
}

/// Runs `body` inside a fresh session.
///
/// The session is committed if `body` returns `Ok` and rolled back otherwise.
/// A failed rollback is logged and the body's error is returned unchanged.
pub async fn scoped<F, B, Fut, T, E>(factory: &F, body: B) -> Result<T, E>
where
    F: SessionFactory + ?Sized,
    B: FnOnce(Session) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<SessionError> + std::fmt::Display,
{
    let session = factory.begin().await?;
    tracing::debug!(session = session.id(), "Opened session");

    match body(session.clone()).await {
        Ok(value) => {
            factory.commit(session).await?;
            Ok(value)
        }
        Err(err) => {
            tracing::warn!(session = session.id(), error = %err, "Rolling back session");
            if let Err(rollback_err) = factory.rollback(session).await {
                tracing::error!(error = %rollback_err, "Failed to roll back session");
            }
            Err(err)
        }
    }
}
