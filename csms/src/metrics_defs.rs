//! Metrics definitions for CSMS reconciliation.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CSMS_PAGE_FETCHES: MetricDef = MetricDef {
    name: "csms.page_fetches",
    metric_type: MetricType::Counter,
    description: "Number of manifest pages fetched from CSMS",
};

pub const RECONCILE_MANIFESTS: MetricDef = MetricDef {
    name: "csms.reconcile.manifests",
    metric_type: MetricType::Counter,
    description: "Manifests evaluated by reconciliation. Tagged with outcome.",
};

pub const RECONCILE_DURATION: MetricDef = MetricDef {
    name: "csms.reconcile.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a reconciliation run in seconds. Tagged with mode.",
};

pub const ALL_METRICS: &[MetricDef] = &[CSMS_PAGE_FETCHES, RECONCILE_MANIFESTS, RECONCILE_DURATION];
