//! Artifact publishing: object storage, compute runtime, uploads

pub mod object_store;
pub mod publisher;
pub mod runtime;
