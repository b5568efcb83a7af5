use crate::acl::{AclError, AclManager};
use crate::dispatch::{WorkBatch, WorkerTask};
use crate::resolver::{PermissionStore, UserGroup};
use async_trait::async_trait;
use reqwest::StatusCode;
use shared::data_model::DataModelError;
use shared::email::{Email, Notifier, NotifyError};
use shared::pubsub::{PublishError, Publisher};
use shared::session::{Session, SessionError, SessionFactory};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type PairKey = (Option<String>, Option<Vec<String>>);

fn key(trial_id: Option<&str>, upload_type: Option<&[&str]>) -> PairKey {
    (
        trial_id.map(str::to_string),
        upload_type.map(|u| u.iter().map(|s| s.to_string()).collect()),
    )
}

#[derive(Default)]
pub struct FakeStore {
    groups: Mutex<Vec<UserGroup>>,
    blobs: Mutex<HashMap<PairKey, Vec<String>>>,
    fail_lookups: AtomicBool,
    user_lookups: AtomicUsize,
    sessions: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl FakeStore {
    pub fn set_groups(&self, groups: Vec<UserGroup>) {
        *self.groups.lock().unwrap() = groups;
    }

    pub fn set_blobs(&self, trial_id: Option<&str>, upload_type: Option<&[&str]>, blobs: &[&str]) {
        self.blobs.lock().unwrap().insert(
            key(trial_id, upload_type),
            blobs.iter().map(|b| b.to_string()).collect(),
        );
    }

    pub fn fail_lookups(&self) {
        self.fail_lookups.store(true, Ordering::SeqCst);
    }

    pub fn user_lookups(&self) -> usize {
        self.user_lookups.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for FakeStore {
    async fn begin(&self) -> Result<Session, SessionError> {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Session::new(format!("session-{n}")))
    }

    async fn commit(&self, _session: Session) -> Result<(), SessionError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, _session: Session) -> Result<(), SessionError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PermissionStore for FakeStore {
    async fn user_emails_for_trial_upload(
        &self,
        _session: &Session,
        _trial_id: Option<&str>,
        _upload_type: Option<&[String]>,
    ) -> Result<Vec<UserGroup>, DataModelError> {
        self.user_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(DataModelError::Status {
                path: "permissions/user_emails".into(),
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "database unavailable".into(),
            });
        }
        Ok(self.groups.lock().unwrap().clone())
    }

    async fn blob_names(
        &self,
        _session: &Session,
        trial_id: Option<&str>,
        upload_type: Option<&[String]>,
    ) -> Result<Vec<String>, DataModelError> {
        let key = (trial_id.map(str::to_string), upload_type.map(|u| u.to_vec()));
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }
}

/// Records acknowledged worker messages. Publishes after the first
/// `fail_after` succeed are rejected.
#[derive(Default)]
pub struct CapturePublisher {
    published: Mutex<Vec<(String, WorkBatch)>>,
    attempts: AtomicUsize,
    fail_after: Option<usize>,
}

impl CapturePublisher {
    pub fn failing_after(successes: usize) -> Self {
        CapturePublisher {
            fail_after: Some(successes),
            ..Default::default()
        }
    }

    pub fn batches(&self) -> Vec<WorkBatch> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, batch)| batch.clone())
            .collect()
    }

    /// Publish calls made, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

#[async_trait]
impl Publisher for CapturePublisher {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String, PublishError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|n| attempt >= n) {
            return Err(PublishError::Rejected {
                topic: topic.to_string(),
                status: StatusCode::SERVICE_UNAVAILABLE,
            });
        }
        let WorkerTask::PermissionsWorker(batch) = serde_json::from_slice(&data)?;
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), batch));
        Ok(format!("message-{attempt}"))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AclCall {
    Grant { users: Vec<String>, blobs: Vec<String> },
    Revoke { users: Vec<String>, blobs: Vec<String> },
}

#[derive(Default)]
pub struct RecordingAcl {
    calls: Mutex<Vec<AclCall>>,
    fail: bool,
}

impl RecordingAcl {
    pub fn failing() -> Self {
        RecordingAcl {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<AclCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: AclCall) -> Result<(), AclError> {
        self.calls.lock().unwrap().push(call);
        if self.fail {
            return Err(AclError::BadStatus(StatusCode::FORBIDDEN));
        }
        Ok(())
    }
}

#[async_trait]
impl AclManager for RecordingAcl {
    async fn grant(&self, users: &[String], blobs: &[String]) -> Result<(), AclError> {
        self.record(AclCall::Grant {
            users: users.to_vec(),
            blobs: blobs.to_vec(),
        })
    }

    async fn revoke(&self, users: &[String], blobs: &[String]) -> Result<(), AclError> {
        self.record(AclCall::Revoke {
            users: users.to_vec(),
            blobs: blobs.to_vec(),
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Email>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, email: Email) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::NoRecipients);
        }
        self.sent.lock().unwrap().push(email);
        Ok(())
    }
}
