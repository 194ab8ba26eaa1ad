//! Command tests and their shared setup.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use modhost_core::HostAbi;
use tempfile::TempDir;

pub mod plugin_test;
pub mod run_test;

/// The binary, isolated from the user's directories and `MODHOST_*` variables.
pub fn modhost(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("modhost").unwrap();
    cmd.env("XDG_DATA_HOME", temp.path().join("data"))
        .env("XDG_CONFIG_HOME", temp.path().join("config"))
        .env_remove("MODHOST_PLUGIN_PATH")
        .env_remove("MODHOST_SETTINGS_PATH")
        .env_remove("MODHOST_CORE_PLUGIN")
        .env_remove("MODHOST_LOG_JSON")
        .env_remove("RUST_LOG");
    cmd
}

/// A library image carrying this host's own verification record.
pub fn compatible_plugin(dir: &Path, file_name: &str) -> PathBuf {
    modhost_testing::write_plugin_file(dir, file_name, &HostAbi::current().record())
}
