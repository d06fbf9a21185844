//! Audio plugin hosting module
//!
//! The core only talks to plugins through [`PluginLoader`] and
//! [`PluginBackend`]. The CLAP adapter in `clap_host` is the native
//! implementation; tests substitute in-process fakes.

mod buffers;
mod clap_host;
mod editor;
mod host_callbacks;
mod instance;

pub use buffers::NativeBuffers;
pub use clap_host::ClapLoader;
pub use editor::{EditorSession, EDITOR_IDLE_INTERVAL};
pub use host_callbacks::HostCommands;
pub use instance::{PluginInstance, ProcessingState};

use std::ffi::c_void;
use std::path::Path;

use super::error::AudioError;

/// Processing configuration handed to every plugin on load
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostConfig {
    /// Frames per `process` call, constant for the plugin's lifetime
    pub block_size: usize,
    /// Sample rate in Hz
    pub sample_rate: f32,
}

/// Static plugin information reported at load time
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub path: String,
    pub uid: String,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub num_parameters: usize,
    pub has_editor: bool,
}

/// Snapshot of one plugin parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub index: usize,
    pub name: String,
    /// Value formatted by the plugin itself
    pub display: String,
    /// Unit label, e.g. "dB"
    pub label: String,
    /// Normalized value in [0, 1]
    pub value: f32,
}

/// Opaque native parent window handle for plugin editors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHandle(pub *mut c_void);

// SAFETY: the handle is only forwarded to the plugin, never dereferenced by the host
unsafe impl Send for WindowHandle {}
unsafe impl Sync for WindowHandle {}

/// A loaded native plugin.
///
/// All methods take `&self`: parameter access may run on a control thread
/// while `process_replacing` runs on the streaming thread. Making that safe
/// is the plugin's responsibility, as with any native host.
pub trait PluginBackend: Send + Sync {
    /// Get plugin information
    fn info(&self) -> &PluginInfo;

    /// Apply sample rate and block size and switch the plugin on
    fn configure(&self, config: &HostConfig) -> Result<(), AudioError>;

    /// Begin processing
    fn start_processing(&self) -> Result<(), AudioError>;

    /// End processing and switch the plugin off
    fn stop_processing(&self);

    /// Parameter name
    fn parameter_name(&self, index: usize) -> String;

    /// Parameter value formatted by the plugin
    fn parameter_display(&self, index: usize) -> String;

    /// Parameter unit label
    fn parameter_label(&self, index: usize) -> String;

    /// Normalized parameter value
    fn get_parameter(&self, index: usize) -> f32;

    /// Set a normalized parameter value
    fn set_parameter(&self, index: usize, value: f32);

    /// Process exactly `frames` frames from `inputs` into `outputs`
    fn process_replacing(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize);

    /// Open plugin editor inside `parent`
    fn open_editor(&self, parent: WindowHandle) -> Result<(), AudioError>;

    /// Close plugin editor
    fn close_editor(&self);

    /// Periodic tick while the editor is open
    fn editor_idle(&self);
}

/// Resolves and loads native plugin modules
pub trait PluginLoader: Send + Sync {
    /// Load the plugin at `path` configured for `config`
    fn load(&self, path: &Path, config: HostConfig) -> Result<Box<dyn PluginBackend>, AudioError>;

    /// Release a plugin returned by [`PluginLoader::load`]
    fn unload(&self, plugin: Box<dyn PluginBackend>);
}
