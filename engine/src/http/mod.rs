pub mod client;
pub mod notify;
