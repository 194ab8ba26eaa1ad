//! Tests for the default `run` command: start-up failures and their exit codes.

use std::fs;

use predicates::prelude::*;
use tempfile::TempDir;

use super::{compatible_plugin, modhost};

/// Test that an empty plugin directory names the missing core plugin.
#[test]
fn test_missing_core_plugin_lists_searched_paths() {
    let temp = TempDir::new().unwrap();
    let plugins = temp.path().join("plugins");
    fs::create_dir_all(&plugins).unwrap();

    let mut cmd = modhost(&temp);
    cmd.arg("-pluginpath")
        .arg(&plugins)
        .arg("-settingspath")
        .arg(temp.path().join("settings.redb"));

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Could not find the Core plugin."))
        .stderr(predicate::str::contains("Searched paths:"))
        .stderr(predicate::str::contains(plugins.display().to_string()));
}

/// Test that `run` is the default command.
#[test]
fn test_explicit_run_command() {
    let temp = TempDir::new().unwrap();

    let mut cmd = modhost(&temp);
    cmd.arg("run")
        .arg("--pluginpath")
        .arg(temp.path())
        .arg("--settingspath")
        .arg(temp.path().join("settings.redb"));

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Could not find the Core plugin."));
}

/// Test that a disabled core plugin stops the host.
#[test]
fn test_disabled_core_plugin() {
    let temp = TempDir::new().unwrap();
    compatible_plugin(temp.path(), "libCore.so");

    let mut cmd = modhost(&temp);
    cmd.arg("-pluginpath")
        .arg(temp.path())
        .arg("-settingspath")
        .arg(temp.path().join("settings.redb"))
        .arg("-noload")
        .arg("Core");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("The Core plugin is disabled."));
}

/// Test that a core plugin the OS refuses to map is reported with the loader error.
#[test]
fn test_unloadable_core_plugin() {
    let temp = TempDir::new().unwrap();
    compatible_plugin(temp.path(), "libCore.so");

    let mut cmd = modhost(&temp);
    cmd.arg("-pluginpath")
        .arg(temp.path())
        .arg("-settingspath")
        .arg(temp.path().join("settings.redb"));

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("The Core plugin could not be loaded"))
        .stderr(predicate::str::contains("Cannot load library"));
}

/// Test that the configuration file and environment choose the core plugin.
#[test]
fn test_core_plugin_from_config_and_env() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("modhost.toml");
    fs::write(
        &config,
        format!(
            "core_plugin = \"Shell\"\nuse_install_dir = false\nuse_user_dir = false\nplugin_paths = [{:?}]\nsettings_path = {:?}\n",
            temp.path().display().to_string(),
            temp.path().join("settings.redb").display().to_string(),
        ),
    )
    .unwrap();

    let mut cmd = modhost(&temp);
    cmd.arg("-config").arg(&config);
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Could not find the Shell plugin."));

    let mut cmd = modhost(&temp);
    cmd.arg("-config")
        .arg(&config)
        .env("MODHOST_CORE_PLUGIN", "Editor");
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Could not find the Editor plugin."));
}

/// Test that a broken configuration file is an error.
#[test]
fn test_invalid_config_file() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("modhost.toml");
    fs::write(&config, "core_plugin = [1, 2").unwrap();

    let mut cmd = modhost(&temp);
    cmd.arg("-config").arg(&config);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Failed to load configuration"));
}

/// Test JSON log output.
#[test]
fn test_json_logging() {
    let temp = TempDir::new().unwrap();

    let mut cmd = modhost(&temp);
    cmd.arg("-pluginpath")
        .arg(temp.path())
        .arg("-settingspath")
        .arg(temp.path().join("settings.redb"))
        .env("MODHOST_LOG_JSON", "true");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("\"level\":\"ERROR\""))
        .stderr(predicate::str::contains("Host start-up failed"));
}
