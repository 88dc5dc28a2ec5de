//! HTTP control API

pub mod bindings;
pub mod deployments;
pub mod error;
pub mod handlers;
pub mod projects;
pub mod serve;
pub mod state;
pub mod webhook;
