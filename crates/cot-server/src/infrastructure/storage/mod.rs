//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the relay's TOML file, falls back to
//! defaults when it does not exist, and can write the effective
//! configuration back out for editing.

pub mod config;
