//! Durable state: the project store and the append-only message log,
//! both in one SQLite database behind an async-safe handle.

pub mod db;
pub mod models;

pub use db::{DbHandle, SiteDb};
