//! Download permission grants for stored trial data.
//!
//! A grant request is resolved into (users, blobs) pairs and split into
//! worker messages. The worker applies each message as one bucket IAM update.

pub mod acl;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod grant;
pub mod metrics_defs;
pub mod request;
pub mod resolver;
#[cfg(test)]
mod testutils;
pub mod worker;

pub use grant::GrantHandler;
pub use worker::PermissionsWorker;
