//! Plugin instance lifecycle
//!
//! A [`PluginInstance`] wraps one loaded backend together with the sample
//! arena it processes through. Locking:
//!
//! - `backend` (RwLock): shared by `process` and parameter access, taken
//!   exclusively only by `dispose`.
//! - `core` (Mutex): processing state plus the arena. Only the streaming
//!   thread processes, so it is uncontended in practice.
//!
//! Lock order is always `backend` then `core`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::{
    AudioError, HostConfig, NativeBuffers, Parameter, PluginBackend, PluginInfo, PluginLoader,
    WindowHandle,
};
use crate::audio::channel_adapter;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Processing state of a plugin instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    /// Disposed; the native plugin has been released
    Unloaded,
    /// Loaded and configured, not processing
    Stopped,
    /// Processing blocks
    Started,
}

struct ProcessCore {
    state: ProcessingState,
    buffers: Option<NativeBuffers>,
}

/// One loaded plugin with its own sample buffers
pub struct PluginInstance {
    id: u64,
    path: PathBuf,
    info: PluginInfo,
    config: HostConfig,
    loader: Arc<dyn PluginLoader>,
    backend: RwLock<Option<Box<dyn PluginBackend>>>,
    core: Mutex<ProcessCore>,
    parameters: Mutex<BTreeMap<usize, Parameter>>,
    enabled: AtomicBool,
    editor_open: AtomicBool,
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .field("inputs", &self.info.num_inputs)
            .field("outputs", &self.info.num_outputs)
            .field("state", &self.state())
            .finish()
    }
}

impl PluginInstance {
    /// Load the plugin at `path` through `loader` and prepare it for
    /// `block_size`-frame processing at `sample_rate`.
    ///
    /// On success the instance is `Stopped`. Buffer allocation failure
    /// unloads the plugin again and returns the error.
    pub fn load(
        loader: Arc<dyn PluginLoader>,
        path: impl AsRef<Path>,
        block_size: usize,
        sample_rate: f32,
    ) -> Result<Self, AudioError> {
        let path = path.as_ref();
        if block_size == 0 {
            return Err(AudioError::InvalidArgument(
                "Block size must be greater than zero".to_string(),
            ));
        }

        let config = HostConfig {
            block_size,
            sample_rate,
        };
        let backend = loader.load(path, config)?;
        let info = backend.info().clone();

        if info.num_outputs == 0 {
            warn!("Plugin '{}' has no audio outputs", info.name);
            loader.unload(backend);
            return Err(AudioError::PluginLoad(format!(
                "{}: plugin has no audio outputs",
                path.display()
            )));
        }

        let buffers = match NativeBuffers::new(info.num_inputs, info.num_outputs, block_size) {
            Ok(buffers) => buffers,
            Err(e) => {
                warn!("Buffer allocation failed for {}: {}", info.name, e);
                loader.unload(backend);
                return Err(e);
            }
        };

        if let Err(e) = backend.configure(&config) {
            loader.unload(backend);
            return Err(AudioError::PluginLoad(format!(
                "{}: configuration rejected: {}",
                path.display(),
                e
            )));
        }

        info!(
            "Loaded plugin '{}' (inputs: {}, outputs: {}, parameters: {})",
            info.name, info.num_inputs, info.num_outputs, info.num_parameters
        );

        Ok(Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            path: path.to_path_buf(),
            info,
            config,
            loader,
            backend: RwLock::new(Some(backend)),
            core: Mutex::new(ProcessCore {
                state: ProcessingState::Stopped,
                buffers: Some(buffers),
            }),
            parameters: Mutex::new(BTreeMap::new()),
            enabled: AtomicBool::new(true),
            editor_open: AtomicBool::new(false),
        })
    }

    /// Process-unique identity of this instance
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    pub fn input_count(&self) -> usize {
        self.info.num_inputs
    }

    pub fn output_count(&self) -> usize {
        self.info.num_outputs
    }

    pub fn parameter_count(&self) -> usize {
        self.info.num_parameters
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn sample_rate(&self) -> f32 {
        self.config.sample_rate
    }

    pub fn state(&self) -> ProcessingState {
        self.core.lock().state
    }

    pub fn is_processing(&self) -> bool {
        self.state() == ProcessingState::Started
    }

    /// Whether the instance takes part in processing (bypassed when false)
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(
            "Plugin '{}' {}",
            self.info.name,
            if enabled { "enabled" } else { "bypassed" }
        );
    }

    /// Transition Stopped -> Started. No-op when already started.
    pub fn start(&self) -> Result<(), AudioError> {
        let backend = self.backend.read();
        let mut core = self.core.lock();
        match core.state {
            ProcessingState::Started => Ok(()),
            ProcessingState::Unloaded => Err(AudioError::InvalidOperation(format!(
                "Plugin '{}' has been disposed",
                self.info.name
            ))),
            ProcessingState::Stopped => {
                let backend = backend.as_ref().ok_or_else(|| {
                    AudioError::InvalidOperation("Plugin backend missing".to_string())
                })?;
                backend.start_processing()?;
                core.state = ProcessingState::Started;
                debug!("Started processing for plugin '{}'", self.info.name);
                Ok(())
            }
        }
    }

    /// Transition Started -> Stopped. No-op otherwise.
    pub fn stop(&self) {
        let backend = self.backend.read();
        let mut core = self.core.lock();
        if core.state == ProcessingState::Started {
            if let Some(backend) = backend.as_ref() {
                backend.stop_processing();
            }
            core.state = ProcessingState::Stopped;
            debug!("Stopped processing for plugin '{}'", self.info.name);
        }
    }

    /// Query every parameter from the plugin, refreshing the cache
    pub fn get_parameters(&self) -> Result<BTreeMap<usize, Parameter>, AudioError> {
        let backend = self.backend.read();
        let backend = self.live_backend(&backend)?;

        let snapshot: BTreeMap<usize, Parameter> = (0..self.info.num_parameters)
            .map(|index| (index, query_parameter(backend, index)))
            .collect();

        *self.parameters.lock() = snapshot.clone();
        Ok(snapshot)
    }

    /// Set parameter `index` to a normalized `value`.
    ///
    /// Out-of-range indices and values outside [0, 1] are rejected without
    /// touching the plugin or the cache.
    pub fn set_parameter(&self, index: usize, value: f32) -> Result<(), AudioError> {
        if index >= self.info.num_parameters || !(0.0..=1.0).contains(&value) {
            return Err(AudioError::InvalidParameter(format!(
                "Invalid parameter index or value: index {} (count {}), value {}",
                index, self.info.num_parameters, value
            )));
        }

        let backend = self.backend.read();
        let backend = self.live_backend(&backend)?;
        backend.set_parameter(index, value);

        // Display text belongs to the plugin; re-query instead of formatting here
        let updated = query_parameter(backend, index);
        debug!(
            "Plugin '{}' parameter {} ({}) = {} [{} {}]",
            self.info.name, index, updated.name, value, updated.display, updated.label
        );
        self.parameters.lock().insert(index, updated);
        Ok(())
    }

    /// Last known state of parameter `index` without querying the plugin
    pub fn cached_parameter(&self, index: usize) -> Option<Parameter> {
        self.parameters.lock().get(&index).cloned()
    }

    /// Process exactly one block.
    ///
    /// `inputs` needs at least `input_count` channels and `outputs` at least
    /// `output_count`, each with at least `block_size` samples.
    pub fn process<I, O>(&self, inputs: &[I], outputs: &mut [O]) -> Result<(), AudioError>
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
    {
        let backend = self.backend.read();
        let mut core = self.core.lock();
        if core.state != ProcessingState::Started {
            return Err(AudioError::InvalidOperation(format!(
                "Processing not started for plugin '{}'",
                self.info.name
            )));
        }
        self.check_shape(inputs, outputs)?;

        let backend = backend.as_ref().ok_or_else(|| {
            AudioError::InvalidOperation("Plugin backend missing".to_string())
        })?;
        let buffers = core.buffers.as_mut().ok_or_else(|| {
            AudioError::InvalidOperation("Plugin buffers released".to_string())
        })?;
        run_block(backend.as_ref(), buffers, inputs, outputs, self.config.block_size)
    }

    /// Process one block as a stage of a composed node.
    ///
    /// Behaves like [`process`](Self::process) while the instance is enabled
    /// and started. Otherwise the input is channel-adapted straight to the
    /// output, so a bypassed, stopped or already disposed instance never
    /// fails a block in flight.
    pub fn process_or_bypass<I, O>(&self, inputs: &[I], outputs: &mut [O]) -> Result<(), AudioError>
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
    {
        let backend = self.backend.read();
        let mut core = self.core.lock();
        self.check_shape(inputs, outputs)?;

        let block_size = self.config.block_size;
        let active = core.state == ProcessingState::Started && self.is_enabled();
        match (active, backend.as_ref(), core.buffers.as_mut()) {
            (true, Some(backend), Some(buffers)) => {
                run_block(backend.as_ref(), buffers, inputs, outputs, block_size)
            }
            _ => {
                trace!("Bypassing plugin '{}'", self.info.name);
                check_output_lengths(outputs, self.info.num_outputs, block_size)?;
                channel_adapter::adapt_planar(
                    &inputs[..self.info.num_inputs],
                    &mut outputs[..self.info.num_outputs],
                    block_size,
                );
                Ok(())
            }
        }
    }

    /// Open the plugin's own editor inside `parent`
    pub fn open_editor(&self, parent: WindowHandle) -> Result<(), AudioError> {
        if !self.info.has_editor {
            return Err(AudioError::InvalidOperation(format!(
                "Plugin '{}' has no editor",
                self.info.name
            )));
        }
        let backend = self.backend.read();
        let backend = self.live_backend(&backend)?;
        backend.open_editor(parent)?;
        self.editor_open.store(true, Ordering::SeqCst);
        info!("Opened editor for plugin '{}'", self.info.name);
        Ok(())
    }

    pub fn close_editor(&self) {
        if !self.editor_open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(backend) = self.backend.read().as_ref() {
            backend.close_editor();
        }
        info!("Closed editor for plugin '{}'", self.info.name);
    }

    /// Idle tick, required periodically while the editor is open
    pub fn editor_idle(&self) {
        if !self.editor_open.load(Ordering::SeqCst) {
            return;
        }
        if let Some(backend) = self.backend.read().as_ref() {
            backend.editor_idle();
        }
    }

    pub fn is_editor_open(&self) -> bool {
        self.editor_open.load(Ordering::SeqCst)
    }

    /// Stop processing, release the buffers and unload the plugin.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn dispose(&self) {
        let mut backend_slot = self.backend.write();
        let mut core = self.core.lock();
        if core.state == ProcessingState::Unloaded {
            return;
        }

        if let Some(backend) = backend_slot.as_ref() {
            if self.editor_open.swap(false, Ordering::SeqCst) {
                backend.close_editor();
            }
            if core.state == ProcessingState::Started {
                backend.stop_processing();
            }
        }
        core.buffers = None;
        core.state = ProcessingState::Unloaded;
        drop(core);

        if let Some(backend) = backend_slot.take() {
            self.loader.unload(backend);
        }
        info!("Disposed plugin '{}'", self.info.name);
    }

    fn live_backend<'a>(
        &self,
        slot: &'a Option<Box<dyn PluginBackend>>,
    ) -> Result<&'a dyn PluginBackend, AudioError> {
        slot.as_deref().ok_or_else(|| {
            AudioError::InvalidOperation(format!("Plugin '{}' has been disposed", self.info.name))
        })
    }

    fn check_shape<I, O>(&self, inputs: &[I], outputs: &[O]) -> Result<(), AudioError>
    where
        I: AsRef<[f32]>,
    {
        let block_size = self.config.block_size;
        if inputs.len() < self.info.num_inputs {
            return Err(AudioError::InvalidArgument(format!(
                "Input must have at least {} channels, but has {}",
                self.info.num_inputs,
                inputs.len()
            )));
        }
        if outputs.len() < self.info.num_outputs {
            return Err(AudioError::InvalidArgument(format!(
                "Output must have at least {} channels, but has {}",
                self.info.num_outputs,
                outputs.len()
            )));
        }
        for (i, channel) in inputs.iter().take(self.info.num_inputs).enumerate() {
            let len = channel.as_ref().len();
            if len < block_size {
                return Err(AudioError::InvalidArgument(format!(
                    "Input channel {} must have at least {} samples, but has {}",
                    i, block_size, len
                )));
            }
        }
        Ok(())
    }
}

/// Output channel lengths are only visible through `AsMut`, so they are
/// checked separately from the input shape.
fn check_output_lengths<O: AsMut<[f32]>>(
    outputs: &mut [O],
    num_outputs: usize,
    block_size: usize,
) -> Result<(), AudioError> {
    for (i, channel) in outputs.iter_mut().take(num_outputs).enumerate() {
        let len = channel.as_mut().len();
        if len < block_size {
            return Err(AudioError::InvalidArgument(format!(
                "Output channel {} must have at least {} samples, but has {}",
                i, block_size, len
            )));
        }
    }
    Ok(())
}

fn run_block<I, O>(
    backend: &dyn PluginBackend,
    buffers: &mut NativeBuffers,
    inputs: &[I],
    outputs: &mut [O],
    block_size: usize,
) -> Result<(), AudioError>
where
    I: AsRef<[f32]>,
    O: AsMut<[f32]>,
{
    let num_outputs = buffers.output_count();
    check_output_lengths(outputs, num_outputs, block_size)?;

    for channel in 0..buffers.input_count() {
        buffers.write_input(channel, &inputs[channel].as_ref()[..block_size])?;
    }

    {
        let (native_inputs, mut native_outputs) = buffers.split();
        backend.process_replacing(&native_inputs, &mut native_outputs, block_size);
    }

    for (channel, dest) in outputs.iter_mut().take(num_outputs).enumerate() {
        buffers.read_output(channel, &mut dest.as_mut()[..block_size])?;
    }
    Ok(())
}

fn query_parameter(backend: &dyn PluginBackend, index: usize) -> Parameter {
    Parameter {
        index,
        name: backend.parameter_name(index),
        display: backend.parameter_display(index),
        label: backend.parameter_label(index),
        value: backend.get_parameter(index),
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        self.dispose();
    }
}
