//! In-process plugin and output fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use plugchain::audio::output::{bytes_to_samples, samples_duration};
use plugchain::audio::plugin::{HostConfig, WindowHandle};
use plugchain::audio::{
    AudioError, OutputTransport, PluginBackend, PluginInfo, PluginLoader, TransportFactory,
};

/// Shape and behavior of one fake plugin
#[derive(Debug, Clone)]
pub struct FakeSpec {
    pub inputs: usize,
    pub outputs: usize,
    /// Output channel `c` is input channel `c % inputs` times `gain`
    pub gain: f32,
    pub parameters: Vec<&'static str>,
    /// `start_processing` refuses to start
    pub fail_start: bool,
}

impl FakeSpec {
    pub fn identity(inputs: usize, outputs: usize) -> Self {
        Self {
            inputs,
            outputs,
            gain: 1.0,
            parameters: vec!["Mix", "Drive"],
            fail_start: false,
        }
    }

    pub fn gain(channels: usize, gain: f32) -> Self {
        Self {
            gain,
            ..Self::identity(channels, channels)
        }
    }
}

/// Counters observed across every plugin a [`FakeLoader`] created
#[derive(Debug, Default)]
pub struct FakeStats {
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub process_calls: AtomicUsize,
}

impl FakeStats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeBackend {
    info: PluginInfo,
    spec: FakeSpec,
    values: Mutex<Vec<f32>>,
    stats: Arc<FakeStats>,
}

impl PluginBackend for FakeBackend {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn configure(&self, config: &HostConfig) -> Result<(), AudioError> {
        if config.block_size == 0 {
            return Err(AudioError::PluginError("zero block size".to_string()));
        }
        Ok(())
    }

    fn start_processing(&self) -> Result<(), AudioError> {
        if self.spec.fail_start {
            return Err(AudioError::PluginError("refused to start".to_string()));
        }
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_processing(&self) {
        self.stats.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn parameter_name(&self, index: usize) -> String {
        self.spec
            .parameters
            .get(index)
            .map(|name| name.to_string())
            .unwrap_or_default()
    }

    fn parameter_display(&self, index: usize) -> String {
        let value = self.values.lock().get(index).copied().unwrap_or_default();
        format!("{:.0}", value * 100.0)
    }

    fn parameter_label(&self, _index: usize) -> String {
        "%".to_string()
    }

    fn get_parameter(&self, index: usize) -> f32 {
        self.values.lock().get(index).copied().unwrap_or_default()
    }

    fn set_parameter(&self, index: usize, value: f32) {
        if let Some(slot) = self.values.lock().get_mut(index) {
            *slot = value;
        }
    }

    fn process_replacing(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize) {
        self.stats.process_calls.fetch_add(1, Ordering::SeqCst);
        for (c, out) in outputs.iter_mut().enumerate() {
            if inputs.is_empty() {
                out[..frames].fill(0.0);
                continue;
            }
            let input = inputs[c % inputs.len()];
            for i in 0..frames {
                out[i] = input[i] * self.spec.gain;
            }
        }
    }

    fn open_editor(&self, _parent: WindowHandle) -> Result<(), AudioError> {
        Err(AudioError::PluginError("no editor".to_string()))
    }

    fn close_editor(&self) {}

    fn editor_idle(&self) {}
}

/// Loads fakes registered by file name; anything else fails like a bad module
#[derive(Default)]
pub struct FakeLoader {
    specs: Mutex<HashMap<String, FakeSpec>>,
    pub stats: Arc<FakeStats>,
}

impl FakeLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, name: &str, spec: FakeSpec) -> String {
        self.specs.lock().insert(name.to_string(), spec);
        format!("/plugins/{}.clap", name)
    }
}

impl PluginLoader for FakeLoader {
    fn load(&self, path: &Path, _config: HostConfig) -> Result<Box<dyn PluginBackend>, AudioError> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let spec = self
            .specs
            .lock()
            .get(&name)
            .cloned()
            .ok_or_else(|| AudioError::PluginLoad(format!("{}: not found", path.display())))?;

        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeBackend {
            info: PluginInfo {
                name: name.clone(),
                vendor: "Test".to_string(),
                version: "1.0".to_string(),
                path: path.display().to_string(),
                uid: name,
                num_inputs: spec.inputs,
                num_outputs: spec.outputs,
                num_parameters: spec.parameters.len(),
                has_editor: false,
            },
            values: Mutex::new(vec![0.0; spec.parameters.len()]),
            spec,
            stats: self.stats.clone(),
        }))
    }

    fn unload(&self, _plugin: Box<dyn PluginBackend>) {
        self.stats.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// What a [`FakeOutput`] has seen
#[derive(Debug)]
pub struct OutputRecord {
    pub channels: usize,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
    pub enqueue_calls: usize,
    pub max_buffered: Duration,
    pub play_calls: usize,
    pub pause_calls: usize,
    pub stopped: bool,
    /// Fail every enqueue after this many have succeeded
    pub fail_after: Option<usize>,
    /// Samples still waiting to "play"
    pending: f64,
    playing: bool,
    last_drain: Instant,
}

impl OutputRecord {
    fn drain(&mut self, speed: f64) {
        let now = Instant::now();
        if self.playing {
            let elapsed = now.duration_since(self.last_drain).as_secs_f64();
            let played = elapsed * speed * self.sample_rate as f64 * self.channels as f64;
            self.pending = (self.pending - played).max(0.0);
        }
        self.last_drain = now;
    }
}

/// Output transport that consumes buffered audio in simulated real time
pub struct FakeOutput {
    record: Arc<Mutex<OutputRecord>>,
    speed: f64,
}

impl OutputTransport for FakeOutput {
    fn channels(&self) -> usize {
        self.record.lock().channels
    }

    fn sample_rate(&self) -> u32 {
        self.record.lock().sample_rate
    }

    fn enqueue(&mut self, bytes: &[u8]) -> Result<(), AudioError> {
        let mut record = self.record.lock();
        if record.fail_after.is_some_and(|limit| record.enqueue_calls >= limit) {
            return Err(AudioError::Streaming("device lost".to_string()));
        }
        record.drain(self.speed);
        let before = record.samples.len();
        record.samples.extend(bytes_to_samples(bytes));
        let added = record.samples.len() - before;
        record.pending += added as f64;
        record.enqueue_calls += 1;
        let buffered = samples_duration(
            record.pending.ceil() as usize,
            record.channels,
            record.sample_rate,
        );
        if buffered > record.max_buffered {
            record.max_buffered = buffered;
        }
        Ok(())
    }

    fn buffered_duration(&self) -> Duration {
        let mut record = self.record.lock();
        record.drain(self.speed);
        samples_duration(
            record.pending.ceil() as usize,
            record.channels,
            record.sample_rate,
        )
    }

    fn play(&mut self) -> Result<(), AudioError> {
        let mut record = self.record.lock();
        record.drain(self.speed);
        record.playing = true;
        record.play_calls += 1;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        let mut record = self.record.lock();
        record.drain(self.speed);
        record.playing = false;
        record.pause_calls += 1;
        Ok(())
    }

    fn stop(&mut self) {
        let mut record = self.record.lock();
        record.playing = false;
        record.pending = 0.0;
        record.stopped = true;
    }
}

/// Transport factory for a [`FakeOutput`] playing `speed` times faster than
/// real time. `channels` overrides the channel count the node asks for.
pub fn fake_output(
    channels: Option<usize>,
    speed: f64,
) -> (TransportFactory, Arc<Mutex<OutputRecord>>) {
    let record = Arc::new(Mutex::new(OutputRecord {
        channels: 0,
        sample_rate: 0,
        samples: Vec::new(),
        enqueue_calls: 0,
        max_buffered: Duration::ZERO,
        play_calls: 0,
        pause_calls: 0,
        stopped: false,
        fail_after: None,
        pending: 0.0,
        playing: false,
        last_drain: Instant::now(),
    }));
    let shared = record.clone();
    let factory: TransportFactory = Box::new(move |requested, sample_rate| {
        {
            let mut record = shared.lock();
            record.channels = channels.unwrap_or(requested);
            record.sample_rate = sample_rate;
            record.last_drain = Instant::now();
        }
        Ok(Box::new(FakeOutput {
            record: shared,
            speed,
        }) as Box<dyn OutputTransport>)
    });
    (factory, record)
}

/// A ramp so reordering or dropping samples is visible
pub fn ramp(frames: usize, channels: usize) -> Vec<f32> {
    (0..frames * channels)
        .map(|i| ((i / channels) % 1000) as f32 / 1000.0 + (i % channels) as f32 * 0.0001)
        .collect()
}
