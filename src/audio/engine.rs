//! Streaming engine: pulls blocks through the chain into an output transport
//!
//! One worker thread per session runs the loop. Control calls (pause,
//! resume, chain edits) come from other threads; the only state they share
//! with the loop is the swappable current node plus a few flags.
//!
//! Thread: control methods must not be called from the worker itself.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use super::chain::{Chain, ComposedNode};
use super::decode::FileSource;
use super::device::{open_capture, CaptureDevice, DeviceId};
use super::error::AudioError;
use super::output::{samples_to_bytes, OutputTransport, TransportFactory};
use super::plugin::{PluginInstance, PluginLoader};
use super::source::{resample_to, SampleSource, SharedSource};

/// Lifecycle of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl StreamState {
    /// A session exists and may be reconfigured
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }
}

/// Engine timing and sizing
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Frames per plugin block
    pub block_size: usize,
    /// Chain sample rate in Hz; sources are resampled to it
    pub sample_rate: u32,
    /// Backpressure threshold for the output buffer
    pub buffer_ceiling: Duration,
    /// Sleep between checks while paused
    pub pause_poll: Duration,
    /// Sleep between checks while the output is above the ceiling
    pub backpressure_poll: Duration,
    /// Sleep after an empty read from a live source
    pub empty_read_retry: Duration,
    /// Capacity of the live capture queue
    pub capture_queue: Duration,
    /// Capacity of the output transport's buffer
    pub output_buffer: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 1024,
            sample_rate: 44100,
            buffer_ceiling: Duration::from_millis(300),
            pause_poll: Duration::from_millis(50),
            backpressure_poll: Duration::from_millis(50),
            empty_read_retry: Duration::from_millis(10),
            capture_queue: Duration::from_millis(1000),
            output_buffer: Duration::from_millis(2000),
        }
    }
}

/// What a session plays
pub enum SourceSpec {
    /// Decode a file
    File(PathBuf),
    /// Capture from an input device (`None` for the default device)
    Device(Option<DeviceId>),
    /// Any other source, e.g. an in-memory buffer or a capture queue fed by
    /// the caller
    Stream(Box<dyn SampleSource>),
}

impl std::fmt::Debug for SourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Device(id) => f.debug_tuple("Device").field(id).finish(),
            Self::Stream(source) => f
                .debug_struct("Stream")
                .field("channels", &source.channels())
                .field("sample_rate", &source.sample_rate())
                .finish(),
        }
    }
}

/// State shared between the control side and the worker
struct Shared {
    state: Mutex<StreamState>,
    node: ArcSwapOption<ComposedNode>,
    source: Mutex<Option<SharedSource>>,
    output_channels: AtomicUsize,
    paused: Arc<AtomicBool>,
    cancel: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: StreamState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Stream state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }
}

/// Plays a source through a plugin chain
pub struct StreamEngine {
    config: EngineConfig,
    chain: Arc<Mutex<Chain>>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<Result<(), AudioError>>>,
}

impl StreamEngine {
    /// Create an engine with an empty chain loading plugins through `loader`
    pub fn new(loader: Arc<dyn PluginLoader>, config: EngineConfig) -> Result<Self, AudioError> {
        if config.sample_rate == 0 {
            return Err(AudioError::InvalidArgument(
                "Sample rate must be greater than zero".to_string(),
            ));
        }
        let chain = Chain::new(loader, config.block_size, config.sample_rate as f32)?;
        Ok(Self {
            config,
            chain: Arc::new(Mutex::new(chain)),
            shared: Arc::new(Shared {
                state: Mutex::new(StreamState::Idle),
                node: ArcSwapOption::empty(),
                source: Mutex::new(None),
                output_channels: AtomicUsize::new(0),
                paused: Arc::new(AtomicBool::new(false)),
                cancel: AtomicBool::new(false),
            }),
            worker: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }

    /// Flag the capture side checks to drop samples while paused.
    ///
    /// Hand it to [`capture_queue`](super::source::capture_queue) when
    /// feeding a [`SourceSpec::Stream`] from a live callback.
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        self.shared.paused.clone()
    }

    /// Direct access to the chain.
    ///
    /// Edits made through the guard take effect in a running session only
    /// after [`refresh`](Self::refresh).
    pub fn chain(&self) -> MutexGuard<'_, Chain> {
        self.chain.lock()
    }

    /// Plugins in processing order
    pub fn plugins(&self) -> Vec<Arc<PluginInstance>> {
        self.chain.lock().plugins().to_vec()
    }

    /// The node the loop currently reads from
    pub fn current_node(&self) -> Option<Arc<ComposedNode>> {
        self.shared.node.load_full()
    }

    /// Start a session playing `source` into the transport built by
    /// `transport`.
    ///
    /// Returns once the session is running, or with the setup error
    /// (unsupported format, device failure, ...). Fails with
    /// [`AudioError::InvalidOperation`] while another session is active.
    pub fn play(&mut self, source: SourceSpec, transport: TransportFactory) -> Result<(), AudioError> {
        {
            let mut state = self.shared.state.lock();
            if state.is_active() || *state == StreamState::Stopping {
                return Err(AudioError::InvalidOperation(
                    "A stream is already active".to_string(),
                ));
            }
            *state = StreamState::Starting;
        }
        // Collect the previous session's worker, if any
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(Err(e)) => warn!("Previous stream ended with error: {}", e),
                Err(_) => warn!("Previous stream thread panicked"),
                Ok(Ok(())) => {}
            }
        }

        self.shared.cancel.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);
        info!("Starting stream from {:?}", source);

        let (ready_tx, ready_rx) = mpsc::channel();
        let worker = StreamWorker {
            config: self.config.clone(),
            chain: self.chain.clone(),
            shared: self.shared.clone(),
        };
        let handle = thread::Builder::new()
            .name("plugchain-stream".to_string())
            .spawn(move || worker.run(source, transport, ready_tx))
            .map_err(|e| {
                self.shared.set_state(StreamState::Stopped);
                AudioError::Streaming(format!("Failed to spawn stream thread: {}", e))
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                // Worker exited without reporting; surface its result
                match handle.join() {
                    Ok(Err(e)) => Err(e),
                    _ => Err(AudioError::Streaming(
                        "Stream thread exited during startup".to_string(),
                    )),
                }
            }
        }
    }

    /// Running -> Paused
    pub fn pause(&self) -> Result<(), AudioError> {
        let mut state = self.shared.state.lock();
        match *state {
            StreamState::Paused => Ok(()),
            StreamState::Running => {
                self.shared.paused.store(true, Ordering::SeqCst);
                *state = StreamState::Paused;
                info!("Stream paused");
                Ok(())
            }
            other => Err(AudioError::InvalidOperation(format!(
                "Cannot pause a stream that is {:?}",
                other
            ))),
        }
    }

    /// Paused -> Running
    pub fn resume(&self) -> Result<(), AudioError> {
        let mut state = self.shared.state.lock();
        match *state {
            StreamState::Running => Ok(()),
            StreamState::Paused => {
                self.shared.paused.store(false, Ordering::SeqCst);
                *state = StreamState::Running;
                info!("Stream resumed");
                Ok(())
            }
            other => Err(AudioError::InvalidOperation(format!(
                "Cannot resume a stream that is {:?}",
                other
            ))),
        }
    }

    /// Cancel the session and wait for teardown.
    ///
    /// Returns the error that ended the session, if one did. Does nothing
    /// when no session was started.
    pub fn stop(&mut self) -> Result<(), AudioError> {
        self.shared.cancel.store(true, Ordering::SeqCst);
        self.join_worker()
    }

    /// Wait for the session to end on its own (end of file or error)
    pub fn wait(&mut self) -> Result<(), AudioError> {
        self.join_worker()
    }

    /// Whether the worker has finished, without blocking
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    fn join_worker(&mut self) -> Result<(), AudioError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match worker.join() {
            Ok(result) => result,
            Err(_) => {
                self.shared.set_state(StreamState::Stopped);
                Err(AudioError::Streaming("Stream thread panicked".to_string()))
            }
        }
    }

    /// Load a plugin, append it to the chain and re-chain a running session
    pub fn add_plugin(&self, path: impl Into<PathBuf>) -> Result<Arc<PluginInstance>, AudioError> {
        let mut chain = self.chain.lock();
        let instance = chain.add_plugin(path.into())?;
        if let Err(e) = self.rebuild(&chain) {
            warn!("Plugin '{}' could not join the stream: {}", instance.name(), e);
            // A failed add leaves the chain as it was
            let last = chain.len() - 1;
            if let Ok(added) = chain.take_plugin(last) {
                added.dispose();
            }
            return Err(e);
        }
        Ok(instance)
    }

    /// Remove and dispose the plugin at `index`.
    ///
    /// A running session is switched to a node without the plugin before the
    /// plugin is released.
    pub fn remove_plugin(&self, index: usize) -> Result<(), AudioError> {
        let mut chain = self.chain.lock();
        let instance = chain.take_plugin(index)?;
        let rebuilt = self.rebuild(&chain);
        instance.dispose();
        info!("Plugin '{}' removed from position {}", instance.name(), index);
        rebuilt
    }

    /// Reorder the chain. Out-of-range indices are ignored.
    pub fn move_plugin(&self, old_index: usize, new_index: usize) -> Result<bool, AudioError> {
        let mut chain = self.chain.lock();
        if !chain.move_plugin(old_index, new_index) {
            return Ok(false);
        }
        self.rebuild(&chain)?;
        Ok(true)
    }

    /// Rebuild the running node from the chain's current order
    pub fn refresh(&self) -> Result<(), AudioError> {
        let chain = self.chain.lock();
        self.rebuild(&chain)
    }

    fn rebuild(&self, chain: &Chain) -> Result<(), AudioError> {
        if !self.state().is_active() {
            return Ok(());
        }
        let Some(source) = self.shared.source.lock().clone() else {
            return Ok(());
        };
        let channels = self.shared.output_channels.load(Ordering::SeqCst);
        let node = chain.build_composed_node(source)?.with_output_channels(channels);
        debug!("Re-chained stream: {:?}", node.stage_names());
        self.shared.node.store(Some(Arc::new(node)));
        Ok(())
    }

    /// Stop any session and dispose every plugin
    pub fn shutdown(&mut self) -> Result<(), AudioError> {
        let result = self.stop();
        self.chain.lock().dispose();
        result
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Stream ended with error during shutdown: {}", e);
        }
    }
}

/// Everything the worker thread owns for one session
struct StreamWorker {
    config: EngineConfig,
    chain: Arc<Mutex<Chain>>,
    shared: Arc<Shared>,
}

/// Resources that must be released however the loop exits
struct Session {
    transport: Box<dyn OutputTransport>,
    _capture: Option<CaptureDevice>,
    live: bool,
}

impl StreamWorker {
    fn run(
        self,
        source: SourceSpec,
        transport: TransportFactory,
        ready: mpsc::Sender<Result<(), AudioError>>,
    ) -> Result<(), AudioError> {
        let mut session = match self.start(source, transport) {
            Ok(session) => session,
            Err(e) => {
                error!("Stream failed to start: {}", e);
                self.teardown(None);
                let _ = ready.send(Err(e));
                return Ok(());
            }
        };
        self.shared.set_state(StreamState::Running);
        let _ = ready.send(Ok(()));
        info!("Stream running");

        let result = self.stream_loop(&mut session);
        self.shared.set_state(StreamState::Stopping);
        match &result {
            Ok(()) => info!("Stream finished"),
            Err(e) => error!("Stream failed: {}", e),
        }
        self.teardown(Some(session));
        result
    }

    /// Idle -> Starting -> ready to run
    fn start(&self, source: SourceSpec, transport: TransportFactory) -> Result<Session, AudioError> {
        let (source, capture): (Box<dyn SampleSource>, Option<CaptureDevice>) = match source {
            SourceSpec::File(path) => (Box::new(FileSource::open(&path)?), None),
            SourceSpec::Device(id) => {
                let (device, source) = open_capture(
                    id.as_ref(),
                    self.config.capture_queue,
                    self.config.block_size,
                    self.shared.paused.clone(),
                )?;
                (Box::new(source), Some(device))
            }
            SourceSpec::Stream(source) => (source, None),
        };
        if source.channels() == 0 {
            return Err(AudioError::UnsupportedFormat(
                "Source has no channels".to_string(),
            ));
        }

        let source = SharedSource::new(resample_to(source, self.config.sample_rate)?);
        let live = source.is_live();

        // Hold the chain until the node is published so no edit is missed
        let chain = self.chain.lock();
        let node = chain.build_composed_node(source.clone())?;
        let mut transport = transport(node.channels(), node.sample_rate())?;
        let out_channels = transport.channels();
        let node = node.with_output_channels(out_channels);

        self.shared.output_channels.store(out_channels, Ordering::SeqCst);
        *self.shared.source.lock() = Some(source);
        self.shared.node.store(Some(Arc::new(node)));
        drop(chain);

        transport.play()?;
        Ok(Session {
            transport,
            _capture: capture,
            live,
        })
    }

    fn cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::SeqCst)
    }

    fn stream_loop(&self, session: &mut Session) -> Result<(), AudioError> {
        let transport = &mut session.transport;
        let mut samples = Vec::new();
        let mut bytes = Vec::new();
        let mut transport_paused = false;

        loop {
            if self.cancelled() {
                debug!("Stream cancelled");
                return Ok(());
            }

            if self.shared.paused.load(Ordering::SeqCst) {
                if !transport_paused {
                    transport.pause()?;
                    transport_paused = true;
                }
                thread::sleep(self.config.pause_poll);
                continue;
            }
            if transport_paused {
                transport.play()?;
                transport_paused = false;
            }

            // Snapshot the node once per block; swaps land between blocks
            let Some(node) = self.shared.node.load_full() else {
                return Err(AudioError::Streaming("No composed node".to_string()));
            };
            let channels = node.channels();
            samples.resize(self.config.block_size * channels, 0.0);

            let frames = node.read(&mut samples);
            drop(node);
            if frames == 0 {
                if session.live {
                    thread::sleep(self.config.empty_read_retry);
                    continue;
                }
                debug!("Source exhausted");
                self.drain(transport.as_ref());
                return Ok(());
            }

            samples_to_bytes(&samples[..frames * channels], &mut bytes);
            transport
                .enqueue(&bytes)
                .map_err(|e| AudioError::Streaming(e.to_string()))?;
            trace!(
                "Enqueued {} frames, {:?} buffered",
                frames,
                transport.buffered_duration()
            );

            while transport.buffered_duration() > self.config.buffer_ceiling && !self.cancelled() {
                thread::sleep(self.config.backpressure_poll);
            }
        }
    }

    /// Wait for queued audio to play out after a finite source ends
    fn drain(&self, transport: &dyn OutputTransport) {
        let buffered = transport.buffered_duration();
        let deadline = Instant::now() + buffered + self.config.buffer_ceiling + Duration::from_millis(500);
        while transport.buffered_duration() > Duration::ZERO && !self.cancelled() {
            if Instant::now() > deadline {
                warn!(
                    "Output did not drain, {:?} still buffered",
                    transport.buffered_duration()
                );
                return;
            }
            thread::sleep(self.config.backpressure_poll.min(Duration::from_millis(10)));
        }
    }

    /// Release the transport, capture device and node, then stop plugins
    fn teardown(&self, session: Option<Session>) {
        self.shared.set_state(StreamState::Stopping);
        if let Some(mut session) = session {
            session.transport.stop();
            drop(session);
        }
        let chain = self.chain.lock();
        *self.shared.source.lock() = None;
        self.shared.node.store(None);
        self.shared.output_channels.store(0, Ordering::SeqCst);
        chain.stop_all();
        drop(chain);
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.set_state(StreamState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.buffer_ceiling, Duration::from_millis(300));
    }

    #[test]
    fn test_active_states() {
        assert!(StreamState::Running.is_active());
        assert!(StreamState::Paused.is_active());
        assert!(!StreamState::Idle.is_active());
        assert!(!StreamState::Stopped.is_active());
    }
}
