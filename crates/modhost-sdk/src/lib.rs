//! modhost Plugin SDK
//!
//! Everything a native plugin needs to be found, verified and loaded by a
//! modhost host process:
//! - the [`Plugin`] lifecycle trait
//! - the verification record embedded in the plugin binary ([`abi`])
//! - the [`export_plugin!`] macro exporting the entry points
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use modhost_sdk::prelude::*;
//!
//! #[derive(Default)]
//! struct Greeter;
//!
//! impl Plugin for Greeter {
//!     fn name(&self) -> &str {
//!         "Greeter"
//!     }
//!
//!     fn dependencies(&self) -> Vec<PluginDependency> {
//!         vec![PluginDependency::required("Core", "^0.1")]
//!     }
//!
//!     fn initialize(&mut self, _arguments: &[String]) -> PluginResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! export_plugin!(Greeter::default());
//! ```
//!
//! The crate must be built with `crate-type = ["cdylib"]`, with the same
//! toolchain and SDK minor version as the host.

pub mod abi;
pub mod error;
#[macro_use]
pub mod macros;
pub mod plugin;

pub use abi::{
    BUILD_KEY, DEBUG_BUILD, PluginObject, SDK_VERSION, VERIFICATION_DATA, VERIFICATION_PATTERN,
};
pub use error::{PluginError, PluginResult};
pub use plugin::{DependencyKind, Plugin, PluginDependency};

/// Prelude module with common imports
pub mod prelude {
    pub use crate::error::{PluginError, PluginResult};
    pub use crate::export_plugin;
    pub use crate::plugin::{DependencyKind, Plugin, PluginDependency};
}
