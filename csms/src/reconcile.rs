//! Reconciliation of CSMS manifests against the data model.
//!
//! Every run walks all qc-complete, non-excluded manifests in CSMS, asks the
//! data model what it knows about each one and loads the new ones. A run
//! produces at most one summary email. Manifests are handled strictly in
//! order and one at a time; a failure on one manifest is recorded in the
//! summary and the run moves on to the next.

use crate::criteria::{CriteriaError, ManifestFilter, RunMode, parse_run_mode};
use crate::fetcher::{FetchError, ManifestSource, Pager};
use crate::manifest::{Manifest, ManifestError};
use crate::metrics_defs::{RECONCILE_DURATION, RECONCILE_MANIFESTS};
use crate::store::{Change, ChangeOutcome, ManifestStore};
use shared::email::{Email, Notifier};
use shared::pubsub::PubSubMessage;
use shared::session::{Session, SessionError, scoped};
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Criteria(#[from] CriteriaError),
    #[error("could not list manifests: {0}")]
    Fetch(#[from] FetchError),
    #[error("store session error: {0}")]
    Session(#[from] SessionError),
}

/// The result of reconciling one manifest.
#[derive(Clone, Debug, PartialEq)]
pub enum ReconciliationOutcome {
    Unchanged,
    Changed(Vec<Change>),
    /// `inserted` is false when the run is a dry run.
    NewManifest { inserted: bool },
    Error(String),
}

impl ReconciliationOutcome {
    fn label(&self) -> &'static str {
        match self {
            ReconciliationOutcome::Unchanged => "unchanged",
            ReconciliationOutcome::Changed(_) => "changed",
            ReconciliationOutcome::NewManifest { .. } => "new",
            ReconciliationOutcome::Error(_) => "error",
        }
    }
}

/// Why a manifest was not evaluated.
#[derive(Clone, Debug, PartialEq)]
pub enum SkipReason {
    TrialMismatch { trial_id: String },
    InvalidTrial(ManifestError),
}

/// Human readable lines accumulated over one run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub lines: Vec<String>,
    pub error_occurred: bool,
}

impl RunSummary {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    fn push_error(&mut self, line: String) {
        self.error_occurred = true;
        self.lines.push(line);
    }

    pub fn subject(&self, dry_run: bool, at: OffsetDateTime) -> String {
        let status = if self.error_occurred { "Error" } else { "Success" };
        let prefix = if dry_run { "[DRY RUN] " } else { "" };
        let timestamp = at.format(&Rfc3339).unwrap_or_else(|_| at.to_string());
        format!("{prefix}[CSMS] Update from CSMS {status}: {timestamp}")
    }

    pub fn body(&self) -> String {
        self.lines.join("<br />")
    }
}

/// Counts of what happened during one run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunReport {
    pub dry_run: bool,
    pub pages: usize,
    pub unchanged: usize,
    pub changed: usize,
    pub new: usize,
    pub errors: usize,
    pub skipped: usize,
    pub summary: RunSummary,
}

impl RunReport {
    fn record(&mut self, trial_id: &str, manifest: &Manifest, outcome: &ReconciliationOutcome) {
        counter!(RECONCILE_MANIFESTS, "outcome" => outcome.label()).increment(1);

        let manifest_id = &manifest.manifest_id;
        let samples = manifest.sample_count();
        match outcome {
            ReconciliationOutcome::Unchanged => self.unchanged += 1,
            ReconciliationOutcome::Changed(_) => self.changed += 1,
            ReconciliationOutcome::NewManifest { inserted: true } => {
                self.new += 1;
                self.summary.push(format!(
                    "New {trial_id} manifest {manifest_id} with {samples} samples"
                ));
            }
            ReconciliationOutcome::NewManifest { inserted: false } => {
                self.new += 1;
                self.summary.push(format!(
                    "Would add new {trial_id} manifest {manifest_id} with {samples} samples"
                ));
            }
            ReconciliationOutcome::Error(detail) => {
                self.errors += 1;
                self.summary.push_error(format!(
                    "Problem with {trial_id} manifest {manifest_id}: {detail}"
                ));
            }
        }
    }
}

pub struct Reconciler {
    source: Arc<dyn ManifestSource>,
    store: Arc<dyn ManifestStore>,
    notifier: Arc<dyn Notifier>,
    recipients: Vec<String>,
    uploader_email: String,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn ManifestSource>,
        store: Arc<dyn ManifestStore>,
        notifier: Arc<dyn Notifier>,
        recipients: Vec<String>,
        uploader_email: String,
    ) -> Self {
        Reconciler {
            source,
            store,
            notifier,
            recipients,
            uploader_email,
        }
    }

    /// Entry point for a trigger message.
    pub async fn handle(&self, message: &PubSubMessage) -> Result<RunReport, ReconcileError> {
        let mode = parse_run_mode(message.decode_data())?;
        self.run(mode).await
    }

    pub async fn run(&self, mode: RunMode) -> Result<RunReport, ReconcileError> {
        let started = Instant::now();
        match &mode {
            RunMode::DryRun { reason } => {
                tracing::warn!(%reason, "Reconciling in dry-run mode, nothing will be written");
            }
            RunMode::Live(criteria) => {
                tracing::info!(
                    trial_id = %criteria.trial_id,
                    manifest_id = %criteria.manifest_id,
                    "Reconciling manifests"
                );
            }
        }

        let filter = ManifestFilter::for_mode(&mode);
        let report = scoped(self.store.as_ref(), |session| {
            self.reconcile_all(session, &mode, &filter)
        })
        .await?;

        if !report.summary.is_empty() {
            let email = Email {
                to_emails: self.recipients.clone(),
                subject: report
                    .summary
                    .subject(mode.is_dry_run(), OffsetDateTime::now_utc()),
                html_content: report.summary.body(),
            };
            // The session is already committed, so a redelivery would not
            // report these manifests again.
            if let Err(e) = self.notifier.send(email).await {
                tracing::error!(error = %e, "Failed to send reconciliation summary");
            }
        }

        let mode_label = if mode.is_dry_run() { "dry_run" } else { "live" };
        histogram!(RECONCILE_DURATION, "mode" => mode_label).record(started.elapsed().as_secs_f64());
        tracing::info!(
            pages = report.pages,
            new = report.new,
            changed = report.changed,
            unchanged = report.unchanged,
            errors = report.errors,
            skipped = report.skipped,
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_all(
        &self,
        session: Session,
        mode: &RunMode,
        filter: &ManifestFilter,
    ) -> Result<RunReport, ReconcileError> {
        let mut report = RunReport {
            dry_run: mode.is_dry_run(),
            ..Default::default()
        };

        let mut pager = Pager::new(self.source.as_ref(), filter);
        while let Some(page) = pager.next_page().await? {
            for record in page {
                let manifest = match Manifest::from_record(record) {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        report.skipped += 1;
                        tracing::error!(error = %e, "Skipping malformed manifest record");
                        continue;
                    }
                };
                let manifest = &manifest;
                match self.reconcile_one(&session, mode, manifest).await {
                    Ok((trial_id, outcome)) => report.record(&trial_id, manifest, &outcome),
                    Err(reason) => {
                        report.skipped += 1;
                        match reason {
                            SkipReason::TrialMismatch { trial_id } => tracing::debug!(
                                manifest_id = %manifest.manifest_id,
                                %trial_id,
                                "Skipping manifest from another trial"
                            ),
                            SkipReason::InvalidTrial(e) => tracing::error!(
                                manifest_id = %manifest.manifest_id,
                                error = %e,
                                "Skipping manifest without a single trial"
                            ),
                        }
                    }
                }
            }
        }

        report.pages = pager.pages_fetched();
        Ok(report)
    }

    async fn reconcile_one(
        &self,
        session: &Session,
        mode: &RunMode,
        manifest: &Manifest,
    ) -> Result<(String, ReconciliationOutcome), SkipReason> {
        let trial_id = manifest.trial_id().map_err(SkipReason::InvalidTrial)?;

        if let Some(criteria) = mode.criteria()
            && !criteria.trial_id.matches(&trial_id)
        {
            return Err(SkipReason::TrialMismatch { trial_id });
        }

        let detected = self
            .store
            .detect_manifest_changes(session, manifest, &self.uploader_email)
            .await;

        let outcome = match detected {
            Ok(ChangeOutcome::Unchanged) => {
                tracing::debug!(manifest_id = %manifest.manifest_id, %trial_id, "No changes");
                ReconciliationOutcome::Unchanged
            }
            Ok(ChangeOutcome::Changed(changes)) => {
                for change in &changes {
                    tracing::info!(manifest_id = %manifest.manifest_id, %change, "Detected change");
                }
                ReconciliationOutcome::Changed(changes)
            }
            Ok(ChangeOutcome::New) if mode.is_dry_run() => {
                tracing::info!(manifest_id = %manifest.manifest_id, %trial_id, "Would add new manifest");
                ReconciliationOutcome::NewManifest { inserted: false }
            }
            Ok(ChangeOutcome::New) => {
                match self
                    .store
                    .insert_manifest(session, manifest, &self.uploader_email)
                    .await
                {
                    Ok(()) => {
                        tracing::info!(manifest_id = %manifest.manifest_id, %trial_id, "Added new manifest");
                        ReconciliationOutcome::NewManifest { inserted: true }
                    }
                    Err(e) => {
                        tracing::error!(manifest_id = %manifest.manifest_id, error = %e, "Failed to add manifest");
                        ReconciliationOutcome::Error(e.to_string())
                    }
                }
            }
            Err(e) => {
                tracing::error!(manifest_id = %manifest.manifest_id, error = %e, "Failed to detect changes");
                ReconciliationOutcome::Error(e.to_string())
            }
        };

        Ok((trial_id, outcome))
    }
}
