//! Plugin chain and composed processing nodes
//!
//! A [`Chain`] is the ordered list of loaded plugins. Calling
//! [`Chain::build_composed_node`] materializes that order over a source as a
//! stack of pull stages: each plugin stage reads interleaved audio from the
//! stage before it, adapts the channel count to the plugin's inputs, runs one
//! fixed-size block and hands the plugin's outputs downstream.
//!
//! A node is a snapshot. Mutating the chain afterwards does not change
//! nodes already built; the caller rebuilds and swaps.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::channel_adapter;
use super::error::AudioError;
use super::plugin::{PluginInstance, PluginLoader};
use super::source::{SampleSource, SharedSource};

/// Ordered collection of plugin instances sharing one block size and rate
pub struct Chain {
    plugins: Vec<Arc<PluginInstance>>,
    loader: Arc<dyn PluginLoader>,
    block_size: usize,
    sample_rate: f32,
    disposed: bool,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("plugins", &self.plugins)
            .field("block_size", &self.block_size)
            .field("sample_rate", &self.sample_rate)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Chain {
    pub fn new(
        loader: Arc<dyn PluginLoader>,
        block_size: usize,
        sample_rate: f32,
    ) -> Result<Self, AudioError> {
        if block_size == 0 {
            return Err(AudioError::InvalidArgument(
                "Block size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            plugins: Vec::new(),
            loader,
            block_size,
            sample_rate,
            disposed: false,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugins in processing order
    pub fn plugins(&self) -> &[Arc<PluginInstance>] {
        &self.plugins
    }

    pub fn plugin(&self, index: usize) -> Option<&Arc<PluginInstance>> {
        self.plugins.get(index)
    }

    /// Load the plugin at `path` and append it to the end of the chain.
    ///
    /// On failure the chain is left as it was.
    pub fn add_plugin(&mut self, path: impl AsRef<Path>) -> Result<Arc<PluginInstance>, AudioError> {
        self.ensure_live()?;
        let instance = Arc::new(PluginInstance::load(
            self.loader.clone(),
            path,
            self.block_size,
            self.sample_rate,
        )?);
        self.plugins.push(instance.clone());
        info!(
            "Plugin '{}' added to chain at position {} (inputs: {}, outputs: {})",
            instance.name(),
            self.plugins.len() - 1,
            instance.input_count(),
            instance.output_count()
        );
        Ok(instance)
    }

    /// Move the plugin at `old_index` to `new_index`.
    ///
    /// Does nothing and returns false when either index is out of bounds.
    pub fn move_plugin(&mut self, old_index: usize, new_index: usize) -> bool {
        let len = self.plugins.len();
        if old_index >= len || new_index >= len {
            debug!(
                "Ignoring move {} -> {} in chain of {}",
                old_index, new_index, len
            );
            return false;
        }
        let plugin = self.plugins.remove(old_index);
        self.plugins.insert(new_index, plugin);
        info!("Plugin moved from position {} to {}", old_index, new_index);
        true
    }

    /// Remove the plugin at `index` from the order without disposing it.
    ///
    /// Used when a running node may still reference the instance: the caller
    /// swaps in a rebuilt node first and disposes afterwards.
    pub fn take_plugin(&mut self, index: usize) -> Result<Arc<PluginInstance>, AudioError> {
        if index >= self.plugins.len() {
            return Err(AudioError::InvalidArgument(format!(
                "Plugin index {} out of range (chain has {})",
                index,
                self.plugins.len()
            )));
        }
        Ok(self.plugins.remove(index))
    }

    /// Dispose the plugin at `index` and remove it from the order
    pub fn remove_plugin(&mut self, index: usize) -> Result<(), AudioError> {
        let instance = self.take_plugin(index)?;
        instance.dispose();
        info!("Plugin '{}' removed from position {}", instance.name(), index);
        Ok(())
    }

    /// Stop processing on every plugin. Instances stay loaded.
    pub fn stop_all(&self) {
        for plugin in &self.plugins {
            plugin.stop();
        }
    }

    /// Materialize the current order over `source`.
    ///
    /// Every plugin is started. The node's channel count is the last
    /// plugin's output count, or the source's when the chain is empty.
    pub fn build_composed_node(&self, source: SharedSource) -> Result<ComposedNode, AudioError> {
        self.ensure_live()?;
        if source.sample_rate() as f32 != self.sample_rate {
            warn!(
                "Source runs at {} Hz but chain is configured for {} Hz",
                source.sample_rate(),
                self.sample_rate
            );
        }

        let sample_rate = source.sample_rate();
        let mut head: Box<dyn SampleSource> = Box::new(source);
        for plugin in &self.plugins {
            if plugin.output_count() == 0 {
                return Err(AudioError::InvalidOperation(format!(
                    "Plugin '{}' has no audio outputs and cannot be chained",
                    plugin.name()
                )));
            }
            plugin.start()?;
            debug!(
                "Chaining '{}' ({} -> {} -> {} channels)",
                plugin.name(),
                head.channels(),
                plugin.input_count(),
                plugin.output_count()
            );
            head = Box::new(PluginStage::new(head, plugin.clone(), self.block_size));
        }

        let node = ComposedNode {
            channels: head.channels(),
            sample_rate,
            stages: self.plugins.clone(),
            head: Mutex::new(head),
        };
        debug!(
            "Built composed node with {} stages, {} output channels",
            node.stages.len(),
            node.channels
        );
        Ok(node)
    }

    /// Dispose every plugin and clear the order. Later calls do nothing.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        for plugin in self.plugins.drain(..) {
            plugin.dispose();
        }
        self.disposed = true;
        info!("Chain disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn ensure_live(&self) -> Result<(), AudioError> {
        if self.disposed {
            return Err(AudioError::InvalidOperation(
                "Chain has been disposed".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A ready-to-read source wrapped in the chain's plugin stages.
///
/// Holds the instances it wraps by reference count; disposing an instance
/// while a node still uses it turns that stage into a pass-through.
pub struct ComposedNode {
    head: Mutex<Box<dyn SampleSource>>,
    channels: usize,
    sample_rate: u32,
    stages: Vec<Arc<PluginInstance>>,
}

impl std::fmt::Debug for ComposedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposedNode")
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl ComposedNode {
    /// Read up to `buf.len() / channels` interleaved frames
    pub fn read(&self, buf: &mut [f32]) -> usize {
        self.head.lock().read(buf)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_live(&self) -> bool {
        self.head.lock().is_live()
    }

    /// Instance ids in processing order
    pub fn stage_ids(&self) -> Vec<u64> {
        self.stages.iter().map(|p| p.id()).collect()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|p| p.name().to_string()).collect()
    }

    /// Append a channel adapter so the node yields `channels` channels
    pub fn with_output_channels(self, channels: usize) -> Self {
        if channels == self.channels || channels == 0 {
            return self;
        }
        debug!(
            "Pinning node output from {} to {} channels",
            self.channels, channels
        );
        let head = self.head.into_inner();
        Self {
            head: Mutex::new(Box::new(ChannelMapStage::new(head, channels))),
            channels,
            sample_rate: self.sample_rate,
            stages: self.stages,
        }
    }
}

impl SampleSource for ComposedNode {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> usize {
        self.head.get_mut().read(buf)
    }

    fn is_live(&self) -> bool {
        ComposedNode::is_live(self)
    }
}

/// One plugin wrapped with its input channel adapter.
///
/// Blocks are always `block_size` frames. When a finite upstream ends
/// mid-block the remainder is zero-padded, the full block is processed and
/// only the frames actually read are passed on. Live upstreams are
/// accumulated until a full block is available.
struct PluginStage {
    upstream: Box<dyn SampleSource>,
    instance: Arc<PluginInstance>,
    block_size: usize,
    upstream_channels: usize,
    interleaved_in: Vec<f32>,
    filled: usize,
    planar_in: Vec<Vec<f32>>,
    planar_out: Vec<Vec<f32>>,
    output: Vec<f32>,
    output_pos: usize,
    exhausted: bool,
}

impl PluginStage {
    fn new(upstream: Box<dyn SampleSource>, instance: Arc<PluginInstance>, block_size: usize) -> Self {
        let upstream_channels = upstream.channels();
        Self {
            interleaved_in: vec![0.0; block_size * upstream_channels],
            filled: 0,
            planar_in: vec![vec![0.0; block_size]; instance.input_count()],
            planar_out: vec![vec![0.0; block_size]; instance.output_count()],
            output: Vec::with_capacity(block_size * instance.output_count()),
            output_pos: 0,
            exhausted: false,
            upstream,
            instance,
            block_size,
            upstream_channels,
        }
    }

    /// Pull and process one block. Returns false when nothing was produced.
    fn process_block(&mut self) -> bool {
        let channels = self.upstream_channels;
        while self.filled < self.block_size {
            let start = self.filled * channels;
            let frames = self.upstream.read(&mut self.interleaved_in[start..]);
            if frames == 0 {
                if !self.upstream.is_live() {
                    self.exhausted = true;
                }
                break;
            }
            self.filled += frames;
        }

        let frames = self.filled;
        if frames == 0 || (frames < self.block_size && !self.exhausted) {
            return false;
        }

        self.interleaved_in[frames * channels..].fill(0.0);
        channel_adapter::deinterleave_adapt(
            &self.interleaved_in,
            self.block_size,
            channels,
            &mut self.planar_in,
        );

        if let Err(e) = self
            .instance
            .process_or_bypass(&self.planar_in, &mut self.planar_out)
        {
            error!(
                "Plugin '{}' failed a block, passing it through: {}",
                self.instance.name(),
                e
            );
            channel_adapter::adapt_planar(&self.planar_in, &mut self.planar_out, self.block_size);
        }

        let out_channels = self.planar_out.len();
        self.output.clear();
        self.output.resize(frames * out_channels, 0.0);
        channel_adapter::interleave_into(&self.planar_out, frames, &mut self.output);
        self.output_pos = 0;
        self.filled = 0;
        true
    }
}

impl SampleSource for PluginStage {
    fn channels(&self) -> usize {
        self.instance.output_count()
    }

    fn sample_rate(&self) -> u32 {
        self.upstream.sample_rate()
    }

    fn read(&mut self, buf: &mut [f32]) -> usize {
        let channels = self.channels();
        let wanted = (buf.len() / channels) * channels;
        let mut written = 0;
        while written < wanted {
            if self.output_pos == self.output.len() {
                if self.exhausted || !self.process_block() {
                    break;
                }
                continue;
            }
            let n = (wanted - written).min(self.output.len() - self.output_pos);
            buf[written..written + n]
                .copy_from_slice(&self.output[self.output_pos..self.output_pos + n]);
            self.output_pos += n;
            written += n;
        }
        written / channels
    }

    fn is_live(&self) -> bool {
        self.upstream.is_live()
    }
}

/// Trailing adapter converting a node's channel count
struct ChannelMapStage {
    upstream: Box<dyn SampleSource>,
    channels: usize,
    scratch: Vec<f32>,
}

impl ChannelMapStage {
    fn new(upstream: Box<dyn SampleSource>, channels: usize) -> Self {
        Self {
            upstream,
            channels,
            scratch: Vec::new(),
        }
    }
}

impl SampleSource for ChannelMapStage {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.upstream.sample_rate()
    }

    fn read(&mut self, buf: &mut [f32]) -> usize {
        let source_channels = self.upstream.channels();
        let frames = buf.len() / self.channels;
        self.scratch.resize(frames * source_channels, 0.0);
        let read = self.upstream.read(&mut self.scratch);
        channel_adapter::adapt_interleaved(
            &self.scratch[..read * source_channels],
            source_channels,
            self.channels,
            buf,
        ) / self.channels
    }

    fn is_live(&self) -> bool {
        self.upstream.is_live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::plugin::{HostConfig, PluginBackend, PluginInfo, WindowHandle};
    use crate::audio::source::MemorySource;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Adds `offset` to every sample, copying input channels to outputs cyclically
    struct OffsetBackend {
        info: PluginInfo,
        offset: f32,
        calls: Arc<AtomicU32>,
    }

    impl PluginBackend for OffsetBackend {
        fn info(&self) -> &PluginInfo {
            &self.info
        }
        fn configure(&self, _config: &HostConfig) -> Result<(), AudioError> {
            Ok(())
        }
        fn start_processing(&self) -> Result<(), AudioError> {
            Ok(())
        }
        fn stop_processing(&self) {}
        fn parameter_name(&self, _index: usize) -> String {
            String::new()
        }
        fn parameter_display(&self, _index: usize) -> String {
            String::new()
        }
        fn parameter_label(&self, _index: usize) -> String {
            String::new()
        }
        fn get_parameter(&self, _index: usize) -> f32 {
            0.0
        }
        fn set_parameter(&self, _index: usize, _value: f32) {}
        fn process_replacing(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for (c, out) in outputs.iter_mut().enumerate() {
                for i in 0..frames {
                    out[i] = inputs[c % inputs.len()][i] + self.offset;
                }
            }
        }
        fn open_editor(&self, _parent: WindowHandle) -> Result<(), AudioError> {
            Ok(())
        }
        fn close_editor(&self) {}
        fn editor_idle(&self) {}
    }

    struct OffsetLoader {
        calls: Arc<AtomicU32>,
    }

    impl PluginLoader for OffsetLoader {
        fn load(&self, path: &Path, _config: HostConfig) -> Result<Box<dyn PluginBackend>, AudioError> {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            let offset: f32 = stem
                .parse()
                .map_err(|_| AudioError::PluginLoad(format!("bad fake plugin {}", stem)))?;
            Ok(Box::new(OffsetBackend {
                info: PluginInfo {
                    name: stem.to_string(),
                    vendor: String::new(),
                    version: String::new(),
                    path: path.display().to_string(),
                    uid: stem.to_string(),
                    num_inputs: 2,
                    num_outputs: 2,
                    num_parameters: 0,
                    has_editor: false,
                },
                offset,
                calls: self.calls.clone(),
            }))
        }
        fn unload(&self, _plugin: Box<dyn PluginBackend>) {}
    }

    fn chain(block_size: usize) -> (Chain, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let loader = Arc::new(OffsetLoader {
            calls: calls.clone(),
        });
        (Chain::new(loader, block_size, 44100.0).unwrap(), calls)
    }

    fn shared(samples: Vec<f32>, channels: usize) -> SharedSource {
        SharedSource::new(Box::new(MemorySource::new(samples, channels, 44100).unwrap()))
    }

    fn read_all(node: &ComposedNode) -> Vec<f32> {
        let mut out = Vec::new();
        let mut buf = vec![0.0f32; 64 * node.channels()];
        loop {
            let frames = node.read(&mut buf);
            if frames == 0 {
                break;
            }
            out.extend_from_slice(&buf[..frames * node.channels()]);
        }
        out
    }

    #[test]
    fn test_failed_add_leaves_chain_unchanged() {
        let (mut chain, _) = chain(16);
        chain.add_plugin("1.clap").unwrap();
        assert!(chain.add_plugin("not-a-number.clap").is_err());
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_move_out_of_bounds_is_noop() {
        let (mut chain, _) = chain(16);
        chain.add_plugin("1.clap").unwrap();
        chain.add_plugin("2.clap").unwrap();
        let before: Vec<u64> = chain.plugins().iter().map(|p| p.id()).collect();
        assert!(!chain.move_plugin(0, 2));
        assert!(!chain.move_plugin(5, 0));
        let after: Vec<u64> = chain.plugins().iter().map(|p| p.id()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_partial_final_block_is_zero_padded_and_truncated() {
        let (mut chain, calls) = chain(16);
        chain.add_plugin("1.clap").unwrap();
        // 20 frames: one full block plus a 4-frame tail
        let node = chain.build_composed_node(shared(vec![0.5; 40], 2)).unwrap();
        let out = read_all(&node);
        assert_eq!(out.len(), 40);
        assert!(out.iter().all(|&s| s == 1.5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_output_channel_pinning() {
        let (chain, _) = chain(8);
        let node = chain
            .build_composed_node(shared(vec![0.25; 16], 1))
            .unwrap()
            .with_output_channels(2);
        assert_eq!(node.channels(), 2);
        let out = read_all(&node);
        assert_eq!(out.len(), 32);
        assert!(out.iter().all(|&s| s == 0.25));
    }

    #[test]
    fn test_disposed_stage_passes_through() {
        let (mut chain, calls) = chain(8);
        chain.add_plugin("1.clap").unwrap();
        let node = chain.build_composed_node(shared(vec![0.5; 32], 2)).unwrap();
        chain.plugin(0).unwrap().dispose();
        let out = read_all(&node);
        assert_eq!(out.len(), 32);
        assert!(out.iter().all(|&s| s == 0.5));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_block_passes_through_and_stage_continues() {
        let calls = Arc::new(AtomicU32::new(0));
        let loader = Arc::new(OffsetLoader {
            calls: calls.clone(),
        });
        // The instance expects 16-frame blocks but the stage hands it 8
        let instance = PluginInstance::load(loader, "1.clap", 16, 44100.0).unwrap();
        instance.start().unwrap();
        let upstream = Box::new(MemorySource::new(vec![0.5; 64], 2, 44100).unwrap());
        let mut stage = PluginStage::new(upstream, Arc::new(instance), 8);

        let mut buf = vec![0.0f32; 16];
        let mut out = Vec::new();
        let mut reads = 0;
        loop {
            let frames = stage.read(&mut buf);
            if frames == 0 {
                break;
            }
            reads += 1;
            out.extend_from_slice(&buf[..frames * 2]);
        }
        assert_eq!(reads, 4);
        assert_eq!(out.len(), 64);
        assert!(out.iter().all(|&s| s == 0.5));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dispose_is_idempotent_and_blocks_use() {
        let (mut chain, _) = chain(8);
        chain.add_plugin("1.clap").unwrap();
        let plugin = chain.plugin(0).unwrap().clone();
        chain.dispose();
        chain.dispose();
        assert!(chain.is_empty());
        assert_eq!(plugin.state(), crate::audio::plugin::ProcessingState::Unloaded);
        assert!(chain.add_plugin("2.clap").is_err());
        assert!(chain.build_composed_node(shared(vec![], 1)).is_err());
    }
}
