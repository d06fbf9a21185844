//! Audio processing module
//!
//! Plugin hosting, channel adaptation, chain composition, sources and the
//! streaming engine that plays a chain into an output device.

pub mod chain;
pub mod channel_adapter;
pub mod decode;
mod device;
mod engine;
mod error;
pub mod output;
pub mod plugin;
pub mod source;

pub use chain::{Chain, ComposedNode};
pub use decode::FileSource;
pub use device::{
    list_input_devices, list_output_devices, open_capture, AudioDevice, CaptureDevice, DeviceId,
};
pub use engine::{EngineConfig, SourceSpec, StreamEngine, StreamState};
pub use error::AudioError;
pub use output::{CpalOutput, OutputTransport, TransportFactory};
pub use plugin::{
    ClapLoader, EditorSession, Parameter, PluginBackend, PluginInfo, PluginInstance, PluginLoader,
};
pub use source::{capture_queue, MemorySource, SampleSource, SharedSource};
