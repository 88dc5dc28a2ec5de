pub mod directory;
pub mod edge;
