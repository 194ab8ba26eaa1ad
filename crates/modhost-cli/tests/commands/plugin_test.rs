//! Tests for the `plugin` command and its subcommands.

use std::fs;

use modhost_core::{HostAbi, PackedVersion, VerificationRecord};
use predicates::prelude::*;
use tempfile::TempDir;

use super::{compatible_plugin, modhost};

/// Test that plugin command requires a subcommand.
#[test]
fn test_plugin_requires_subcommand() {
    let temp = TempDir::new().unwrap();
    let mut cmd = modhost(&temp);
    cmd.arg("plugin");

    cmd.assert().failure().code(2);
}

/// Test plugin validate requires path argument.
#[test]
fn test_plugin_validate_requires_path() {
    let temp = TempDir::new().unwrap();
    let mut cmd = modhost(&temp);
    cmd.arg("plugin").arg("validate");

    cmd.assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("required"))
        .stderr(predicate::str::contains("<PATH>"));
}

/// Test plugin validate on a missing file.
#[test]
fn test_plugin_validate_missing_file() {
    let temp = TempDir::new().unwrap();
    let mut cmd = modhost(&temp);
    cmd.arg("plugin")
        .arg("validate")
        .arg(temp.path().join("libghost.so"));

    cmd.assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("FAILED"))
        .stdout(predicate::str::contains("was not found"));
}

/// Test plugin validate accepts a file carrying this host's record.
#[test]
fn test_plugin_validate_compatible_file() {
    let temp = TempDir::new().unwrap();
    let path = compatible_plugin(temp.path(), "libcore.so");
    let host = HostAbi::current();

    let mut cmd = modhost(&temp);
    cmd.arg("plugin").arg("validate").arg(&path).arg("--verbose");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Plugin Validation: PASSED"))
        .stdout(predicate::str::contains(format!("Runtime version: {}", host.version)))
        .stdout(predicate::str::contains(host.build_key.clone()))
        .stdout(predicate::str::contains("--- Host ---"))
        .stdout(predicate::str::contains("Last modified:"));
}

/// Test plugin validate rejects a file without a verification record.
#[test]
fn test_plugin_validate_plain_file() {
    let temp = TempDir::new().unwrap();
    let path = modhost_testing::write_plain_file(temp.path(), "libnotes.so");

    let mut cmd = modhost(&temp);
    cmd.arg("plugin").arg("validate").arg(&path);

    cmd.assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("Plugin Validation: FAILED"))
        .stdout(predicate::str::contains("is not a valid plugin"));
}

/// Test plugin validate rejects a plugin built for another runtime series.
#[test]
fn test_plugin_validate_incompatible_version() {
    let temp = TempDir::new().unwrap();
    let host = HostAbi::current();
    let newer = VerificationRecord::new(
        PackedVersion::new(host.version.major().wrapping_add(1), 0, 0),
        host.debug,
        host.build_key.clone(),
    );
    let path = modhost_testing::write_plugin_file(temp.path(), "libnewer.so", &newer);

    let mut cmd = modhost(&temp);
    cmd.arg("plugin").arg("validate").arg(&path);

    cmd.assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("incompatible runtime library"))
        .stdout(predicate::str::contains(newer.version.to_string()))
        .stdout(predicate::str::contains(format!(
            "built against modhost-sdk {}",
            host.version
        )));
}

/// Test plugin validate --load reports OS loader failures.
#[test]
fn test_plugin_validate_load_reports_os_error() {
    let temp = TempDir::new().unwrap();
    let path = compatible_plugin(temp.path(), "libcore.so");

    let mut cmd = modhost(&temp);
    cmd.arg("plugin").arg("validate").arg(&path).arg("--load");

    cmd.assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("FAILED"))
        .stdout(predicate::str::contains("Cannot load library"));
}

/// Test plugin list with an empty directory.
#[test]
fn test_plugin_list_empty_dir() {
    let temp = TempDir::new().unwrap();
    let mut cmd = modhost(&temp);
    cmd.arg("plugin").arg("list").arg("--dir").arg(temp.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Discovered Plugins"))
        .stdout(predicate::str::contains("No plugins found."));
}

/// Test plugin list shows accepted and rejected plugins and skips other files.
#[test]
fn test_plugin_list_with_dir() {
    let temp = TempDir::new().unwrap();
    compatible_plugin(temp.path(), "libcore.so");
    let host = HostAbi::current();
    let foreign = HostAbi::new(host.version, "other-target rustc-0.0.0 full-config", host.debug);
    modhost_testing::write_plugin_file(temp.path(), "libforeign.so", &foreign.record());
    modhost_testing::write_plain_file(temp.path(), "libnotes.so");
    fs::write(temp.path().join("README.md"), "docs").unwrap();

    let mut cmd = modhost(&temp);
    cmd.arg("plugin").arg("list").arg("-d").arg(temp.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Discovered Plugins"))
        .stdout(predicate::str::contains("core"))
        .stdout(predicate::str::contains("ok"))
        .stdout(predicate::str::contains("foreign"))
        .stdout(predicate::str::contains("rejected:"))
        .stdout(predicate::str::contains("libnotes.so").not())
        .stdout(predicate::str::contains("README.md").not());
}

/// Test plugin list over the configured search paths.
#[test]
fn test_plugin_list_uses_search_paths() {
    let temp = TempDir::new().unwrap();
    let plugins = temp.path().join("plugins");
    fs::create_dir_all(&plugins).unwrap();
    compatible_plugin(&plugins, "libcore.so");

    let mut cmd = modhost(&temp);
    cmd.arg("-pluginpath").arg(&plugins).arg("plugin").arg("list");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(format!("Searched: {}", plugins.display())))
        .stdout(predicate::str::contains("libcore.so"));
}
