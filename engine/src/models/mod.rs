//! Data models

pub mod binding;
pub mod deployment;
pub mod project;
