//! Metrics definitions for device provisioning.

use shared::metrics_defs::{MetricDef, MetricType};

pub const PROVISION_RESULT: MetricDef = MetricDef {
    name: "provision.result",
    metric_type: MetricType::Counter,
    description: "Resolved device credentials. Tagged with source (identity_store, credential_service, minted) or error.",
};

pub const PROVISION_DURATION: MetricDef = MetricDef {
    name: "provision.duration",
    metric_type: MetricType::Histogram,
    description: "Time to resolve or create a device credential in seconds",
};

pub const IDENTITY_STORE_LOOKUP_FAILED: MetricDef = MetricDef {
    name: "identity_store.lookup_failed",
    metric_type: MetricType::Counter,
    description: "Identity store lookups that failed and fell through to the credential service",
};

pub const ORPHANED_IDENTITY: MetricDef = MetricDef {
    name: "provision.orphaned_identity",
    metric_type: MetricType::Counter,
    description: "Identities minted remotely that could not be persisted. Tagged with action (kept, deleted, delete_failed).",
};

pub const ALL_METRICS: &[MetricDef] = &[
    PROVISION_RESULT,
    PROVISION_DURATION,
    IDENTITY_STORE_LOOKUP_FAILED,
    ORPHANED_IDENTITY,
];
