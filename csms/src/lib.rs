//! Reconciles clinical sample manifests held in CSMS with the trial metadata
//! stored in the data model.

pub mod config;
pub mod criteria;
pub mod fetcher;
pub mod manifest;
pub mod metrics_defs;
pub mod reconcile;
pub mod store;
#[cfg(test)]
mod testutils;

pub use reconcile::{ReconcileError, Reconciler, RunReport};
