use csms::config::Config as CsmsConfig;
use permissions::config::Config as PermissionsConfig;
use serde::Deserialize;
use shared::auth::TokenConfig;
use std::fs::File;
use url::Url;

pub const PUBSUB_URL: &str = "https://pubsub.googleapis.com/";

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "cidc.functions".into()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
    #[serde(default)]
    pub environment: Option<String>,
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct GoogleConfig {
    pub project: String,
    #[serde(default = "default_pubsub_url")]
    pub pubsub_url: Url,
    #[serde(default)]
    pub auth: TokenConfig,
}

fn default_pubsub_url() -> Url {
    Url::parse(PUBSUB_URL).expect("pubsub URL is a valid absolute URL")
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct DataModelConfig {
    pub url: Url,
    #[serde(default)]
    pub auth: TokenConfig,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct EmailsConfig {
    /// Topic consumed by the email relay
    pub topic: String,
}

/// Topic each function is subscribed to.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Topics {
    pub csms_update: String,
    pub grant_download_permissions: String,
    pub worker: String,
}

impl Default for Topics {
    fn default() -> Self {
        Topics {
            csms_update: "csms_update".into(),
            grant_download_permissions: "grant_download_permissions".into(),
            worker: "worker".into(),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub listener: Listener,
    pub google: GoogleConfig,
    pub data_model: DataModelConfig,
    pub emails: EmailsConfig,
    #[serde(default)]
    pub topics: Topics,
    pub csms: Option<CsmsConfig>,
    pub permissions: Option<PermissionsConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.listener.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if self.google.project.is_empty() {
            return Err(ValidationError::EmptyProject);
        }
        if self.emails.topic.is_empty() {
            return Err(ValidationError::EmptyTopic("emails"));
        }

        let topics = [
            ("csms_update", &self.topics.csms_update),
            ("grant_download_permissions", &self.topics.grant_download_permissions),
            ("worker", &self.topics.worker),
        ];
        for (i, (name, topic)) in topics.iter().enumerate() {
            if topic.is_empty() {
                return Err(ValidationError::EmptyTopic(*name));
            }
            if topics[..i].iter().any(|(_, other)| other == topic) {
                return Err(ValidationError::DuplicateTopic((*topic).clone()));
            }
        }

        if let Some(csms) = &self.csms {
            csms.validate()?;
        }
        if let Some(permissions) = &self.permissions {
            permissions.validate()?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,
    #[error("Empty Google project")]
    EmptyProject,
    #[error("Empty {0} topic")]
    EmptyTopic(&'static str),
    #[error("Topic {0} is bound to more than one function")]
    DuplicateTopic(String),
    #[error("invalid csms config: {0}")]
    Csms(#[from] csms::config::ValidationError),
    #[error("invalid permissions config: {0}")]
    Permissions(#[from] permissions::config::ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    const BASE: &str = r#"
listener:
    host: 0.0.0.0
    port: 8080
google:
    project: cidc-staging
data_model:
    url: http://data-model.internal/api/
emails:
    topic: emails
"#;

    #[test]
    fn minimal_config() {
        let tmp = write_tmp_file(BASE);
        let config = Config::from_file(tmp.path()).expect("load config");
        assert_eq!(config.common, CommonConfig::default());
        assert_eq!(config.google.pubsub_url.as_str(), PUBSUB_URL);
        assert_eq!(config.google.auth, TokenConfig::default());
        assert_eq!(config.topics, Topics::default());
        assert_eq!(config.csms, None);
        assert_eq!(config.permissions, None);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn full_config() {
        let yaml = format!(
            r#"{BASE}
metrics:
    statsd_host: 127.0.0.1
    statsd_port: 8125
logging:
    sentry_dsn: https://key@sentry.example.org/1
    environment: staging
topics:
    worker: permissions-worker
csms:
    api:
        url: https://csms.example.org/api
        auth:
            type: static
            token: t
    summary_recipients:
        - cidc@example.org
permissions:
    worker_topic: permissions-worker
    acl:
        bucket: cidc-data-staging
        role: projects/cidc/roles/download
"#
        );
        let tmp = write_tmp_file(&yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        let metrics = config.common.metrics.as_ref().expect("metrics config");
        assert_eq!(metrics.statsd_port, 8125);
        assert_eq!(metrics.prefix, "cidc.functions");
        assert_eq!(
            config.common.logging.as_ref().and_then(|l| l.environment.as_deref()),
            Some("staging")
        );
        assert_eq!(config.topics.worker, "permissions-worker");
        assert_eq!(config.topics.csms_update, "csms_update");
        assert_eq!(config.csms.as_ref().map(|c| c.api.page_size), Some(5000));
        assert_eq!(
            config.permissions.as_ref().map(|p| p.blobs_per_chunk),
            Some(100)
        );
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn invalid_config() {
        let mut config: Config = serde_yaml::from_str(BASE).unwrap();
        config.listener.port = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));
        config.listener.port = 8080;

        config.topics.worker = "csms_update".into();
        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicateTopic("csms_update".into()))
        );
        config.topics.worker = String::new();
        assert_eq!(config.validate(), Err(ValidationError::EmptyTopic("worker")));
    }

    #[test]
    fn missing_file() {
        let result = Config::from_file(std::path::Path::new("/nonexistent/functions.yaml"));
        assert!(matches!(result, Err(ConfigError::LoadError(_))));
    }
}
