//! Shipyard Engine Library
//!
//! Deployment pipeline and release activation: builds revisions in
//! sandboxes, publishes immutable artifacts, and points hostnames at them.

pub mod app;
pub mod authn;
pub mod cache;
pub mod deploy;
pub mod diagnostic;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod publish;
pub mod retention;
pub mod routing;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod utils;
pub mod workers;
