//! Caches

pub mod dependency;
