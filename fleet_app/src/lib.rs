//! # fleet_app
//!
//! Process plumbing for the fleet sync binaries: config files, logging, shutdown and arguments.

pub mod cli;
pub mod config_loader;
pub mod shutdown_handler;
pub mod tracing_setup;
