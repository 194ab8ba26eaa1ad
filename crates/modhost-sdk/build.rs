//! Computes the build key embedded in every plugin's verification record.
//!
//! The key identifies the target and compiler a binary was built with. Host and
//! plugin must agree on it before any Rust types are passed between them.

use std::env;
use std::process::Command;

fn main() {
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown-target".to_string());
    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());

    let rustc_version = Command::new(&rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .and_then(|text| text.split_whitespace().nth(1).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());

    println!(
        "cargo:rustc-env=MODHOST_BUILD_KEY={} rustc-{} full-config",
        target, rustc_version
    );
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=RUSTC");
}
