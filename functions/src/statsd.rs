use crate::config::MetricsConfig;
use metrics_exporter_statsd::StatsdBuilder;
use shared::metrics_defs::describe_all;

#[derive(thiserror::Error, Debug)]
pub enum MetricsError {
    #[error("could not build statsd recorder: {0}")]
    Build(#[from] metrics_exporter_statsd::StatsdError),
    #[error("could not install metrics recorder: {0}")]
    Install(String),
}

/// Installs the statsd recorder and registers every metric description.
pub fn init(config: &MetricsConfig) -> Result<(), MetricsError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(config.prefix.as_str()))?;
    metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

    describe_all(csms::metrics_defs::ALL_METRICS);
    describe_all(permissions::metrics_defs::ALL_METRICS);
    describe_all(crate::service::ALL_METRICS);
    tracing::info!(host = %config.statsd_host, port = config.statsd_port, "Metrics enabled");
    Ok(())
}
