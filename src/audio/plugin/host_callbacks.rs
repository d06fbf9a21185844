//! Host command surface exposed to loaded plugins
//!
//! Plugins call back into the host from arbitrary threads. Every call is
//! logged at trace level and runs under `catch_unwind`, so a failing handler
//! degrades to a neutral answer instead of unwinding into native code.

use std::ffi::CStr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::HostConfig;

const PRODUCT_NAME: &CStr = c"plugchain";
const VENDOR_NAME: &CStr = c"plugchain developers";
const HOST_VERSION: &CStr =
    match CStr::from_bytes_with_nul(concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes()) {
        Ok(version) => version,
        Err(_) => c"0",
    };

/// Answers plugin-to-host requests for one plugin instance
#[derive(Debug)]
pub struct HostCommands {
    config: Mutex<HostConfig>,
    plugin_id: Mutex<String>,
    restart_requested: AtomicBool,
    process_requested: AtomicBool,
    callback_requested: AtomicBool,
    flush_requested: AtomicBool,
}

impl HostCommands {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config: Mutex::new(config),
            plugin_id: Mutex::new(String::new()),
            restart_requested: AtomicBool::new(false),
            process_requested: AtomicBool::new(false),
            callback_requested: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
        }
    }

    /// Record the identity of the plugin these commands serve
    pub fn set_plugin_id(&self, id: &str) {
        *self.plugin_id.lock() = id.to_string();
    }

    /// Replace the block size and sample rate reported from now on
    pub fn set_config(&self, config: HostConfig) {
        *self.config.lock() = config;
    }

    /// Run a handler, logging the call and absorbing panics
    fn guarded<T>(&self, call: &str, default: T, handler: impl FnOnce() -> T) -> T {
        trace!(plugin = %self.plugin_id.lock(), "Plugin called {}", call);
        match panic::catch_unwind(AssertUnwindSafe(handler)) {
            Ok(value) => value,
            Err(_) => {
                warn!("Host callback {} failed, answering with default", call);
                default
            }
        }
    }

    pub fn block_size(&self) -> usize {
        self.guarded("get_block_size()", 0, || self.config.lock().block_size)
    }

    pub fn sample_rate(&self) -> f32 {
        self.guarded("get_sample_rate()", 0.0, || self.config.lock().sample_rate)
    }

    pub fn plugin_id(&self) -> String {
        self.guarded("get_current_plugin_id()", String::new(), || {
            self.plugin_id.lock().clone()
        })
    }

    /// Host name, vendor and version as published in the host struct
    pub fn identity(&self) -> (&'static CStr, &'static CStr, &'static CStr) {
        (PRODUCT_NAME, VENDOR_NAME, HOST_VERSION)
    }

    /// The plugin started a gesture on parameter `index`
    pub fn begin_edit(&self, index: usize) {
        self.guarded(&format!("begin_edit({})", index), (), || {
            debug!("Plugin '{}' began editing parameter {}", self.plugin_id(), index)
        })
    }

    /// The plugin finished a gesture on parameter `index`
    pub fn end_edit(&self, index: usize) {
        self.guarded(&format!("end_edit({})", index), (), || {
            debug!("Plugin '{}' finished editing parameter {}", self.plugin_id(), index)
        })
    }

    /// The plugin changed parameter `index` on its own (editor, automation)
    pub fn parameter_automated(&self, index: usize, value: f32) {
        self.guarded(
            &format!("set_parameter_automated({}, {})", index, value),
            (),
            || {},
        )
    }

    pub fn process_idle(&self) {
        self.guarded("process_idle()", (), || {})
    }

    pub fn size_window(&self, width: u32, height: u32) -> bool {
        self.guarded(&format!("size_window({}, {})", width, height), false, || {
            true
        })
    }

    pub fn update_display(&self) -> bool {
        self.guarded("update_display()", false, || false)
    }

    pub fn request_restart(&self) {
        self.guarded("request_restart()", (), || {
            self.restart_requested.store(true, Ordering::SeqCst)
        })
    }

    pub fn request_process(&self) {
        self.guarded("request_process()", (), || {
            self.process_requested.store(true, Ordering::SeqCst)
        })
    }

    /// The plugin wants `on_main_thread` called from the host's idle tick
    pub fn request_callback(&self) {
        self.guarded("request_callback()", (), || {
            self.callback_requested.store(true, Ordering::SeqCst)
        })
    }

    /// The plugin wants its parameter queue flushed
    pub fn request_flush(&self) {
        self.guarded("request_flush()", (), || {
            self.flush_requested.store(true, Ordering::SeqCst)
        })
    }

    /// Consume a pending main-thread callback request
    pub fn take_callback_request(&self) -> bool {
        self.callback_requested.swap(false, Ordering::SeqCst)
    }

    /// Consume a pending parameter flush request
    pub fn take_flush_request(&self) -> bool {
        self.flush_requested.swap(false, Ordering::SeqCst)
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands() -> HostCommands {
        HostCommands::new(HostConfig {
            block_size: 1024,
            sample_rate: 44100.0,
        })
    }

    #[test]
    fn test_reports_host_config() {
        let host = commands();
        host.set_plugin_id("com.example.gain");
        assert_eq!(host.block_size(), 1024);
        assert_eq!(host.sample_rate(), 44100.0);
        assert_eq!(host.plugin_id(), "com.example.gain");

        let (product, _vendor, version) = host.identity();
        assert_eq!(product.to_str().unwrap(), "plugchain");
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_config_update_is_reported() {
        let host = commands();
        host.set_config(HostConfig {
            block_size: 256,
            sample_rate: 48000.0,
        });
        assert_eq!(host.block_size(), 256);
        assert_eq!(host.sample_rate(), 48000.0);
    }

    #[test]
    fn test_notifications_are_accepted() {
        let host = commands();
        host.begin_edit(3);
        host.parameter_automated(3, 0.5);
        host.end_edit(3);
        assert!(host.size_window(640, 480));
    }

    #[test]
    fn test_callback_request_is_consumed_once() {
        let host = commands();
        assert!(!host.take_callback_request());
        host.request_callback();
        assert!(host.take_callback_request());
        assert!(!host.take_callback_request());
    }

    #[test]
    fn test_panicking_handler_returns_default() {
        let host = commands();
        let value = host.guarded("broken()", 7u32, || panic!("handler failure"));
        assert_eq!(value, 7);
    }
}
