//! Parsing of the reconciliation trigger payload.
//!
//! The payload is a flat JSON object with optional `trial_id` and
//! `manifest_id` keys. Each value is a literal to match exactly or the
//! wildcard `"*"`. Anything that cannot be read as such an object puts the run
//! in dry-run mode; an object naming only one of the two keys is rejected.

use serde::Deserialize;
use serde_json::{Map, Value};
use shared::pubsub::EnvelopeError;
use std::fmt;

pub const WILDCARD: &str = "*";
pub const QC_COMPLETE: &str = "qc_complete";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Match {
    Any,
    Exact(String),
}

impl Match {
    fn parse(value: String) -> Self {
        if value == WILDCARD {
            Match::Any
        } else {
            Match::Exact(value)
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Match::Any => true,
            Match::Exact(expected) => expected == value,
        }
    }

    pub fn literal(&self) -> Option<&str> {
        match self {
            Match::Any => None,
            Match::Exact(value) => Some(value),
        }
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Match::Any => f.write_str(WILDCARD),
            Match::Exact(value) => f.write_str(value),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchCriteria {
    pub trial_id: Match,
    pub manifest_id: Match,
}

/// How a reconciliation run behaves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Evaluate and report every manifest without mutating anything.
    DryRun { reason: String },
    Live(MatchCriteria),
}

impl RunMode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, RunMode::DryRun { .. })
    }

    pub fn criteria(&self) -> Option<&MatchCriteria> {
        match self {
            RunMode::DryRun { .. } => None,
            RunMode::Live(criteria) => Some(criteria),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CriteriaError {
    #[error(
        "trial_id and manifest_id must both be provided, you provided: {provided}; use \"*\" to match everything"
    )]
    Incomplete { provided: String },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCriteria {
    trial_id: Option<String>,
    manifest_id: Option<String>,
}

/// Turns a decoded trigger payload into a run mode.
///
/// Malformed input never fails here; it yields [`RunMode::DryRun`]. The only
/// error is a well-formed payload that names exactly one of the two keys.
pub fn parse_run_mode(payload: Result<String, EnvelopeError>) -> Result<RunMode, CriteriaError> {
    let raw = match payload {
        Ok(raw) => raw,
        Err(e) => {
            return Ok(RunMode::DryRun {
                reason: format!("no usable payload: {e}"),
            });
        }
    };

    // Only a JSON object is accepted; a sequence must not fill the fields by position.
    let parsed = serde_json::from_str::<Map<String, Value>>(&raw)
        .and_then(|object| serde_json::from_value::<RawCriteria>(Value::Object(object)));
    let parsed = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            return Ok(RunMode::DryRun {
                reason: format!("could not parse match criteria: {e}"),
            });
        }
    };

    match (parsed.trial_id, parsed.manifest_id) {
        (Some(trial_id), Some(manifest_id)) => Ok(RunMode::Live(MatchCriteria {
            trial_id: Match::parse(trial_id),
            manifest_id: Match::parse(manifest_id),
        })),
        (None, None) => Ok(RunMode::DryRun {
            reason: "no match criteria given".into(),
        }),
        _ => Err(CriteriaError::Incomplete { provided: raw }),
    }
}

/// Server-side filter applied when listing manifests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestFilter {
    pub status: String,
    pub excluded: bool,
    pub manifest_id: Option<String>,
}

impl ManifestFilter {
    pub fn for_mode(mode: &RunMode) -> Self {
        ManifestFilter {
            status: QC_COMPLETE.to_string(),
            excluded: false,
            manifest_id: mode
                .criteria()
                .and_then(|c| c.manifest_id.literal())
                .map(String::from),
        }
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("status", self.status.clone()),
            ("excluded", self.excluded.to_string()),
        ];
        if let Some(manifest_id) = &self.manifest_id {
            pairs.push(("manifest_id", manifest_id.clone()));
        }
        pairs
    }
}
