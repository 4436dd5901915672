// Library crate for integration tests.
// main.rs has its own mod declarations; this re-exports all modules.

pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod providers;
pub mod routes;
pub mod server;
pub mod state;
