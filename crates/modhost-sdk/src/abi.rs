//! Binary interface shared by the host and its plugins.
//!
//! Every plugin carries a plain-text verification record inside its binary.
//! The host finds it by byte search, before any plugin code runs, and decides
//! from it whether the library may be loaded at all:
//!
//! ```text
//! pattern=MODHOST_PLUGIN_VERIFICATION_DATA
//! version=<major>.<minor>.<patch>
//! debug=true|false
//! buildkey=<target> rustc-<version> full-config
//! ```
//!
//! Besides the record, a plugin exports three C symbols:
//! - [`QUERY_VERIFICATION_SYMBOL`] returns the record text without side effects
//! - [`INSTANCE_SYMBOL`] creates the plugin's root object
//! - [`DESTROY_SYMBOL`] destroys that object again (optional)

use std::os::raw::c_char;

use crate::plugin::Plugin;

/// Marker the host searches for. The record starts with it.
pub const VERIFICATION_PATTERN: &str = "pattern=MODHOST_PLUGIN_VERIFICATION_DATA";

/// Symbol returning the NUL-terminated verification record.
pub const QUERY_VERIFICATION_SYMBOL: &str = "modhost_plugin_query_verification_data";

/// Symbol creating the plugin root object.
pub const INSTANCE_SYMBOL: &str = "modhost_plugin_instance";

/// Symbol destroying the root object returned by [`INSTANCE_SYMBOL`].
pub const DESTROY_SYMBOL: &str = "modhost_plugin_destroy";

/// Runtime version of this SDK. Host and plugins compare it.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build key of this compilation (target triple and compiler version).
pub const BUILD_KEY: &str = env!("MODHOST_BUILD_KEY");

/// Whether this SDK was compiled with debug assertions.
pub const DEBUG_BUILD: bool = cfg!(debug_assertions);

macro_rules! verification_record {
    ($debug:literal) => {
        concat!(
            "pattern=MODHOST_PLUGIN_VERIFICATION_DATA\nversion=",
            env!("CARGO_PKG_VERSION"),
            "\ndebug=",
            $debug,
            "\nbuildkey=",
            env!("MODHOST_BUILD_KEY"),
            "\n\0"
        )
    };
}

/// The verification record of every plugin built against this SDK.
///
/// NUL-terminated so it can be handed out through [`QUERY_VERIFICATION_SYMBOL`].
#[cfg(debug_assertions)]
#[used]
pub static VERIFICATION_DATA: &str = verification_record!("true");

/// The verification record of every plugin built against this SDK.
///
/// NUL-terminated so it can be handed out through [`QUERY_VERIFICATION_SYMBOL`].
#[cfg(not(debug_assertions))]
#[used]
pub static VERIFICATION_DATA: &str = verification_record!("false");

/// Root object handed from a plugin to the host.
///
/// Passing a trait object across the boundary is only sound because the host
/// refuses plugins whose build key differs from its own.
pub type PluginObject = Box<dyn Plugin>;

/// Signature of [`QUERY_VERIFICATION_SYMBOL`].
pub type QueryVerificationFn = unsafe extern "C" fn() -> *const c_char;

/// Signature of [`INSTANCE_SYMBOL`].
#[allow(improper_ctypes_definitions)]
pub type InstanceFn = unsafe extern "C" fn() -> *mut PluginObject;

/// Signature of [`DESTROY_SYMBOL`].
#[allow(improper_ctypes_definitions)]
pub type DestroyFn = unsafe extern "C" fn(*mut PluginObject);

/// Pointer to the embedded record, for the generated query function.
pub fn verification_data_ptr() -> *const c_char {
    VERIFICATION_DATA.as_ptr().cast()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_starts_with_pattern() {
        assert!(VERIFICATION_DATA.starts_with(VERIFICATION_PATTERN));
    }

    #[test]
    fn test_record_is_nul_terminated() {
        assert!(VERIFICATION_DATA.ends_with("\n\0"));
        assert_eq!(VERIFICATION_DATA.matches('\0').count(), 1);
    }

    #[test]
    fn test_record_carries_build_configuration() {
        assert!(VERIFICATION_DATA.contains(&format!("version={}\n", SDK_VERSION)));
        assert!(VERIFICATION_DATA.contains(&format!("debug={}\n", DEBUG_BUILD)));
        assert!(VERIFICATION_DATA.contains(&format!("buildkey={}\n", BUILD_KEY)));
    }
}
