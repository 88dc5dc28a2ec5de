//! Storage layer

pub mod layout;
pub mod settings;
pub mod state;
