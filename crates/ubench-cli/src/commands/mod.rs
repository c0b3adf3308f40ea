pub mod client;
pub mod common;
pub mod discover;
pub mod monitor;
pub mod server;
