use shared::metrics_defs::{MetricDef, MetricType};

pub const GRANT_REQUESTS: MetricDef = MetricDef {
    name: "permissions.grant.requests",
    metric_type: MetricType::Counter,
    description: "Grant requests handled. Tagged with outcome.",
};

pub const DISPATCH_CHUNKS: MetricDef = MetricDef {
    name: "permissions.dispatch.chunks",
    metric_type: MetricType::Counter,
    description: "Worker messages published and acknowledged",
};

pub const DISPATCH_FAILURES: MetricDef = MetricDef {
    name: "permissions.dispatch.failures",
    metric_type: MetricType::Counter,
    description: "Dispatches aborted by a publish error",
};

pub const WORKER_BATCHES: MetricDef = MetricDef {
    name: "permissions.worker.batches",
    metric_type: MetricType::Counter,
    description: "Batches applied by the worker. Tagged with action, success.",
};

pub const ACL_UPDATES: MetricDef = MetricDef {
    name: "permissions.acl.updates",
    metric_type: MetricType::Counter,
    description: "Bucket policy writes. Tagged with action.",
};

pub const ACL_CONFLICTS: MetricDef = MetricDef {
    name: "permissions.acl.conflicts",
    metric_type: MetricType::Counter,
    description: "Bucket policy writes rejected because the policy changed",
};

pub const ALL_METRICS: &[MetricDef] = &[
    GRANT_REQUESTS,
    DISPATCH_CHUNKS,
    DISPATCH_FAILURES,
    WORKER_BATCHES,
    ACL_UPDATES,
    ACL_CONFLICTS,
];
