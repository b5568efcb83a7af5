use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// One manifest record as returned by the CSMS API.
///
/// Records are read-only snapshots; they are fetched fresh for every run and
/// handed to the data model unchanged.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Manifest {
    pub manifest_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_identifier: Option<String>,
    #[serde(default)]
    pub samples: Vec<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub excluded: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum ManifestError {
    #[error("manifest {0} has no samples")]
    NoSamples(String),
    #[error("manifest {manifest_id} has samples without a protocol identifier")]
    MissingProtocolIdentifier { manifest_id: String },
    #[error("manifest {manifest_id} has samples from several trials: {trials:?}")]
    InconsistentTrial {
        manifest_id: String,
        trials: Vec<String>,
    },
    #[error("manifest {manifest_id} is malformed: {reason}")]
    Malformed { manifest_id: String, reason: String },
}

impl Manifest {
    /// Decodes one record of a listing page.
    pub fn from_record(record: Value) -> Result<Manifest, ManifestError> {
        let manifest_id = match record.get("manifest_id") {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => "<unknown>".to_string(),
        };
        serde_json::from_value(record).map_err(|e| ManifestError::Malformed {
            manifest_id,
            reason: e.to_string(),
        })
    }

    /// The trial every sample of this manifest belongs to.
    pub fn trial_id(&self) -> Result<String, ManifestError> {
        if self.samples.is_empty() {
            return Err(ManifestError::NoSamples(self.manifest_id.clone()));
        }

        let mut trials = BTreeSet::new();
        for sample in &self.samples {
            match sample.get("protocol_identifier").and_then(Value::as_str) {
                Some(trial) => {
                    trials.insert(trial);
                }
                None => {
                    return Err(ManifestError::MissingProtocolIdentifier {
                        manifest_id: self.manifest_id.clone(),
                    });
                }
            }
        }
        if let Some(top_level) = self.protocol_identifier.as_deref() {
            trials.insert(top_level);
        }

        let mut trials = trials.into_iter();
        match (trials.next(), trials.next()) {
            (Some(trial), None) => Ok(trial.to_string()),
            (first, second) => Err(ManifestError::InconsistentTrial {
                manifest_id: self.manifest_id.clone(),
                trials: first
                    .into_iter()
                    .chain(second)
                    .chain(trials)
                    .map(String::from)
                    .collect(),
            }),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
