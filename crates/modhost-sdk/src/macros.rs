//! Declarative macros for plugin crates.

/// Export the entry points the host looks for.
///
/// Takes an expression constructing the plugin root object. The expression is
/// evaluated once per call of the instance symbol; the host calls it at most
/// once per mapped library.
///
/// # Example
///
/// ```rust,ignore
/// use modhost_sdk::prelude::*;
///
/// struct HelloPlugin;
///
/// impl Plugin for HelloPlugin {
///     fn name(&self) -> &str {
///         "Hello"
///     }
///
///     fn initialize(&mut self, _arguments: &[String]) -> PluginResult<()> {
///         Ok(())
///     }
/// }
///
/// export_plugin!(HelloPlugin);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($constructor:expr) => {
        /// Verification record of this plugin.
        #[no_mangle]
        pub extern "C" fn modhost_plugin_query_verification_data() -> *const ::std::os::raw::c_char
        {
            $crate::abi::verification_data_ptr()
        }

        /// Create the plugin root object. Returns null if construction panicked.
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn modhost_plugin_instance() -> *mut $crate::abi::PluginObject {
            match ::std::panic::catch_unwind(|| {
                let plugin: $crate::abi::PluginObject = ::std::boxed::Box::new($constructor);
                plugin
            }) {
                Ok(plugin) => ::std::boxed::Box::into_raw(::std::boxed::Box::new(plugin)),
                Err(_) => ::std::ptr::null_mut(),
            }
        }

        /// Destroy an object created by `modhost_plugin_instance`.
        ///
        /// # Safety
        /// `instance` must come from `modhost_plugin_instance` of this library
        /// and must not be used afterwards.
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub unsafe extern "C" fn modhost_plugin_destroy(instance: *mut $crate::abi::PluginObject) {
            if !instance.is_null() {
                drop(unsafe { ::std::boxed::Box::from_raw(instance) });
            }
        }
    };
}
