//! Testing utilities for modhost
//!
//! This crate provides:
//! - a counting mock of the OS dynamic linker
//! - fixture plugins with real entry points, recording their lifecycle
//! - fixture library files carrying verification records
//! - isolated temporary directories

pub mod fixtures;
pub mod mock_linker;
pub mod test_utils;

pub use fixtures::{
    events, reset_events, serial, write_plain_file, write_plugin_file, Fixture, FixtureDir,
};
pub use mock_linker::{MockLibrary, MockLinker};
pub use test_utils::{init_tracing, test_id, TestDir};
