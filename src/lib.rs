//! Pybale library exports for testing.
//!
//! This module exposes internal components for integration testing.
//! The `pybale` binary drives the full pipeline; the `pybale-launcher`
//! binary reuses `payload` for locating the embedded archive.

pub mod cache;
pub mod config;
pub mod files;
pub mod layout;
pub mod linked;
pub mod package;
pub mod payload;
pub mod plugin;
pub mod probe;
pub mod process;
pub mod resolve;
pub mod scan;
