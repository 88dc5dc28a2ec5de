//! Deployment module

pub mod executor;
pub mod fsm;
pub mod git;
pub mod logstream;
pub mod pipeline;
pub mod sandbox;
