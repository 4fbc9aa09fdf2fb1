pub mod api;
pub mod config;
pub mod errors;
pub mod intent;
pub mod orchestrator;
pub mod poll;
pub mod runner;
pub mod server;
pub mod store;
pub mod stream;
pub mod sweep;
pub mod workflow;
