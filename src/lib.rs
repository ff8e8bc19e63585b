//! MAVLink router manager - supervises an external MAVLink router
//!
//! This library provides a manager for MAVLink routing programs that:
//! - Keeps a validated, persistent set of routing endpoints
//! - Translates the endpoint set into the command line of the selected router
//! - Discovers which router programs are installed and their versions
//! - Starts, stops and restarts the router, restarting it when it dies
//! - Exposes everything through a small JSON control API

pub mod api;
pub mod backend;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod settings;
pub mod store;
pub mod supervisor;
