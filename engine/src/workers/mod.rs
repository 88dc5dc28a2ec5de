pub mod builder;
pub mod reaper;
pub mod sweeper;
