pub mod auth;
pub mod data_model;
pub mod email;
pub mod http;
pub mod metrics_defs;
pub mod pubsub;
pub mod session;
