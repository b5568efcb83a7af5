use crate::criteria::ManifestFilter;
use crate::fetcher::{FetchError, ManifestSource};
use crate::manifest::Manifest;
use crate::store::{ChangeOutcome, ManifestStore, StoreError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use shared::email::{Email, Notifier, NotifyError};
use shared::session::{Session, SessionError, SessionFactory};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub fn manifest(value: Value) -> Manifest {
    serde_json::from_value(value).unwrap()
}

/// Serves a fixed list of manifests in pages.
pub struct FakeSource {
    records: Vec<Value>,
    page_size: usize,
    fail_at: Mutex<Option<usize>>,
    filters: Mutex<Vec<ManifestFilter>>,
}

impl FakeSource {
    pub fn new(manifests: Vec<Manifest>, page_size: usize) -> Self {
        let records = manifests
            .iter()
            .map(|m| serde_json::to_value(m).unwrap())
            .collect();
        Self::from_records(records, page_size)
    }

    /// Serves records as they would come off the wire, malformed ones included.
    pub fn from_records(records: Vec<Value>, page_size: usize) -> Self {
        FakeSource {
            records,
            page_size,
            fail_at: Mutex::new(None),
            filters: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_at_offset(&self, offset: usize) {
        *self.fail_at.lock().unwrap() = Some(offset);
    }

    /// The filter of every first-page request, in order.
    pub fn filters(&self) -> Vec<ManifestFilter> {
        self.filters.lock().unwrap().clone()
    }
}

#[async_trait]
impl ManifestSource for FakeSource {
    async fn fetch_page(
        &self,
        filter: &ManifestFilter,
        offset: usize,
    ) -> Result<Vec<Value>, FetchError> {
        if offset == 0 {
            self.filters.lock().unwrap().push(filter.clone());
        }
        if *self.fail_at.lock().unwrap() == Some(offset) {
            return Err(FetchError::BadStatus(StatusCode::INTERNAL_SERVER_ERROR));
        }
        Ok(self
            .records
            .iter()
            .skip(offset)
            .take(self.page_size)
            .cloned()
            .collect())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

/// In-memory store that returns canned outcomes and records what was written.
#[derive(Default)]
pub struct FakeStore {
    outcomes: Mutex<HashMap<String, ChangeOutcome>>,
    detect_failures: Mutex<HashMap<String, String>>,
    insert_failures: Mutex<HashMap<String, String>>,
    detected: Mutex<Vec<String>>,
    inserted: Mutex<Vec<String>>,
    sessions: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl FakeStore {
    pub fn set_outcome(&self, manifest_id: &str, outcome: ChangeOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(manifest_id.to_string(), outcome);
    }

    pub fn fail_detection(&self, manifest_id: &str, reason: &str) {
        self.detect_failures
            .lock()
            .unwrap()
            .insert(manifest_id.to_string(), reason.to_string());
    }

    pub fn fail_insert(&self, manifest_id: &str, reason: &str) {
        self.insert_failures
            .lock()
            .unwrap()
            .insert(manifest_id.to_string(), reason.to_string());
    }

    pub fn detected(&self) -> Vec<String> {
        self.detected.lock().unwrap().clone()
    }

    pub fn inserted(&self) -> Vec<String> {
        self.inserted.lock().unwrap().clone()
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
impl ManifestStore for FakeStore {
    async fn detect_manifest_changes(
        &self,
        _session: &Session,
        manifest: &Manifest,
        _uploader_email: &str,
    ) -> Result<ChangeOutcome, StoreError> {
        let id = &manifest.manifest_id;
        self.detected.lock().unwrap().push(id.clone());
        if let Some(reason) = self.detect_failures.lock().unwrap().get(id) {
            return Err(StoreError::Rejected(reason.clone()));
        }
        Ok(self
            .outcomes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or(ChangeOutcome::Unchanged))
    }

    async fn insert_manifest(
        &self,
        _session: &Session,
        manifest: &Manifest,
        _uploader_email: &str,
    ) -> Result<(), StoreError> {
        let id = &manifest.manifest_id;
        if let Some(reason) = self.insert_failures.lock().unwrap().get(id) {
            return Err(StoreError::Rejected(reason.clone()));
        }
        self.inserted.lock().unwrap().push(id.clone());
        Ok(())
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
