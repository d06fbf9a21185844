//! Pull-style sample sources feeding a composed node
//!
//! Every source yields interleaved `f32` frames at a fixed channel count and
//! sample rate. A read returning zero frames means "exhausted" for file and
//! memory sources and "nothing right now" for live sources.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, warn};

use super::channel_adapter;
use super::error::AudioError;

/// Interleaved audio producer
pub trait SampleSource: Send {
    fn channels(&self) -> usize;

    fn sample_rate(&self) -> u32;

    /// Fill `buf` with whole interleaved frames and return the frame count
    fn read(&mut self, buf: &mut [f32]) -> usize;

    /// Live sources may return zero frames without being finished
    fn is_live(&self) -> bool {
        false
    }
}

/// A source handle shared between successive composed nodes.
///
/// Rebuilding a node after a chain mutation reuses the same handle, so the
/// new node continues exactly where the old one stopped reading.
#[derive(Clone)]
pub struct SharedSource {
    inner: Arc<Mutex<Box<dyn SampleSource>>>,
    channels: usize,
    sample_rate: u32,
    live: bool,
}

impl SharedSource {
    pub fn new(source: Box<dyn SampleSource>) -> Self {
        Self {
            channels: source.channels(),
            sample_rate: source.sample_rate(),
            live: source.is_live(),
            inner: Arc::new(Mutex::new(source)),
        }
    }
}

impl std::fmt::Debug for SharedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSource")
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("live", &self.live)
            .finish()
    }
}

impl SampleSource for SharedSource {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> usize {
        self.inner.lock().read(buf)
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

/// Interleaved samples held in memory
#[derive(Debug, Clone)]
pub struct MemorySource {
    samples: Vec<f32>,
    channels: usize,
    sample_rate: u32,
    position: usize,
}

impl MemorySource {
    /// Wrap interleaved `samples`. A trailing partial frame is ignored.
    pub fn new(samples: Vec<f32>, channels: usize, sample_rate: u32) -> Result<Self, AudioError> {
        if channels == 0 {
            return Err(AudioError::InvalidArgument(
                "Source must have at least one channel".to_string(),
            ));
        }
        Ok(Self {
            samples,
            channels,
            sample_rate,
            position: 0,
        })
    }

    /// Build a source from one buffer per channel
    pub fn from_planar<C: AsRef<[f32]>>(planar: &[C], sample_rate: u32) -> Result<Self, AudioError> {
        Self::new(channel_adapter::interleave(planar), planar.len(), sample_rate)
    }

    /// Frames not read yet
    pub fn remaining_frames(&self) -> usize {
        (self.samples.len() - self.position) / self.channels
    }
}

impl SampleSource for MemorySource {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> usize {
        let frames = (buf.len() / self.channels).min(self.remaining_frames());
        let n = frames * self.channels;
        buf[..n].copy_from_slice(&self.samples[self.position..self.position + n]);
        self.position += n;
        frames
    }
}

/// Writer half of a live capture queue, driven by the device callback
pub struct CaptureSink {
    producer: HeapProd<f32>,
    channels: usize,
    paused: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl CaptureSink {
    /// Queue captured interleaved samples.
    ///
    /// Everything is discarded while the session is paused. When the queue
    /// is full, only whole frames that fit are kept. Returns the number of
    /// samples queued.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        if self.paused.load(Ordering::Relaxed) {
            self.dropped.fetch_add(samples.len() as u64, Ordering::Relaxed);
            return 0;
        }
        let fit = (self.producer.vacant_len() / self.channels) * self.channels;
        let n = fit.min(samples.len() - samples.len() % self.channels);
        let pushed = self.producer.push_slice(&samples[..n]);
        let lost = samples.len() - pushed;
        if lost > 0 {
            self.dropped.fetch_add(lost as u64, Ordering::Relaxed);
        }
        pushed
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

/// Reader half of a live capture queue
pub struct CaptureSource {
    consumer: HeapCons<f32>,
    channels: usize,
    sample_rate: u32,
    dropped: Arc<AtomicU64>,
}

impl CaptureSource {
    /// Samples discarded so far (paused or queue full)
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames waiting in the queue
    pub fn queued_frames(&self) -> usize {
        self.consumer.occupied_len() / self.channels
    }
}

impl SampleSource for CaptureSource {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> usize {
        let frames = (buf.len() / self.channels).min(self.queued_frames());
        let n = frames * self.channels;
        self.consumer.pop_slice(&mut buf[..n]) / self.channels
    }

    fn is_live(&self) -> bool {
        true
    }
}

/// Create a bounded live capture queue holding `capacity_frames` frames.
///
/// `paused` is shared with the streaming session; while set, the sink drops
/// incoming samples instead of queueing them.
pub fn capture_queue(
    channels: usize,
    sample_rate: u32,
    capacity_frames: usize,
    paused: Arc<AtomicBool>,
) -> Result<(CaptureSink, CaptureSource), AudioError> {
    if channels == 0 || capacity_frames == 0 {
        return Err(AudioError::InvalidArgument(
            "Capture queue needs at least one channel and one frame".to_string(),
        ));
    }
    let rb = HeapRb::<f32>::new(channels * capacity_frames);
    let (producer, consumer) = rb.split();
    let dropped = Arc::new(AtomicU64::new(0));
    Ok((
        CaptureSink {
            producer,
            channels,
            paused,
            dropped: dropped.clone(),
        },
        CaptureSource {
            consumer,
            channels,
            sample_rate,
            dropped,
        },
    ))
}

const RESAMPLER_CHUNK_FRAMES: usize = 1024;

/// Converts an inner source to a different sample rate
pub struct ResamplingSource {
    inner: Box<dyn SampleSource>,
    resampler: FastFixedIn<f32>,
    target_rate: u32,
    channels: usize,
    /// Planar input collected for the next resampler call
    staged: Vec<Vec<f32>>,
    scratch: Vec<f32>,
    /// Interleaved output not handed out yet
    pending: Vec<f32>,
    pending_pos: usize,
    /// Leading output frames still to discard (resampler delay)
    skip_frames: usize,
    finished: bool,
}

impl ResamplingSource {
    pub fn new(inner: Box<dyn SampleSource>, target_rate: u32) -> Result<Self, AudioError> {
        let channels = inner.channels();
        let source_rate = inner.sample_rate();
        if source_rate == 0 || target_rate == 0 {
            return Err(AudioError::UnsupportedConfig(format!(
                "Cannot resample {} Hz to {} Hz",
                source_rate, target_rate
            )));
        }
        let resampler = FastFixedIn::<f32>::new(
            target_rate as f64 / source_rate as f64,
            1.0,
            PolynomialDegree::Septic,
            RESAMPLER_CHUNK_FRAMES,
            channels,
        )
        .map_err(|e| AudioError::UnsupportedConfig(format!("Failed to create resampler: {}", e)))?;

        debug!(
            "Resampling source from {} Hz to {} Hz ({} channels)",
            source_rate, target_rate, channels
        );

        Ok(Self {
            skip_frames: resampler.output_delay(),
            inner,
            resampler,
            target_rate,
            channels,
            staged: vec![Vec::with_capacity(RESAMPLER_CHUNK_FRAMES); channels],
            scratch: vec![0.0; RESAMPLER_CHUNK_FRAMES * channels],
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
        })
    }

    fn staged_frames(&self) -> usize {
        self.staged.first().map_or(0, Vec::len)
    }

    fn push_output(&mut self, planar: Vec<Vec<f32>>) {
        let frames = planar.first().map_or(0, Vec::len);
        let skip = self.skip_frames.min(frames);
        self.skip_frames -= skip;
        if skip == frames {
            return;
        }
        let kept: Vec<&[f32]> = planar.iter().map(|ch| &ch[skip..]).collect();
        self.pending.extend(channel_adapter::interleave(&kept));
    }

    /// Run the resampler once if enough input is available.
    /// Returns false when no output could be produced right now.
    fn refill(&mut self) -> bool {
        let needed = self.resampler.input_frames_next();
        while self.staged_frames() < needed {
            let want = (needed - self.staged_frames()).min(RESAMPLER_CHUNK_FRAMES);
            let frames = self.inner.read(&mut self.scratch[..want * self.channels]);
            if frames == 0 {
                break;
            }
            let chunk = &self.scratch[..frames * self.channels];
            for (channel, staged) in self.staged.iter_mut().enumerate() {
                staged.extend(chunk.iter().skip(channel).step_by(self.channels));
            }
        }

        if self.staged_frames() >= needed {
            let result = self.resampler.process(&self.staged, None);
            for staged in &mut self.staged {
                staged.clear();
            }
            return match result {
                Ok(out) => {
                    self.push_output(out);
                    true
                }
                Err(e) => {
                    warn!("Resampling failed, ending source: {}", e);
                    self.finished = true;
                    false
                }
            };
        }

        if self.inner.is_live() {
            return false;
        }

        // Inner source exhausted: resample the remainder, then flush the delay line
        self.finished = true;
        if self.staged_frames() > 0 {
            match self.resampler.process_partial(Some(self.staged.as_slice()), None) {
                Ok(out) => self.push_output(out),
                Err(e) => warn!("Resampling the final chunk failed: {}", e),
            }
        }
        match self.resampler.process_partial(None::<&[Vec<f32>]>, None) {
            Ok(out) => self.push_output(out),
            Err(e) => warn!("Flushing the resampler failed: {}", e),
        }
        self.pending.len() > self.pending_pos
    }
}

impl SampleSource for ResamplingSource {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.target_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> usize {
        let wanted = (buf.len() / self.channels) * self.channels;
        let mut written = 0;
        while written < wanted {
            if self.pending_pos == self.pending.len() {
                self.pending.clear();
                self.pending_pos = 0;
                if self.finished || !self.refill() {
                    break;
                }
                continue;
            }
            let n = (wanted - written).min(self.pending.len() - self.pending_pos);
            buf[written..written + n]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
            self.pending_pos += n;
            written += n;
        }
        written / self.channels
    }

    fn is_live(&self) -> bool {
        self.inner.is_live()
    }
}

/// Wrap `source` so it yields `target_rate`, or return it unchanged if it
/// already runs at that rate.
pub fn resample_to(
    source: Box<dyn SampleSource>,
    target_rate: u32,
) -> Result<Box<dyn SampleSource>, AudioError> {
    if source.sample_rate() == target_rate {
        return Ok(source);
    }
    Ok(Box::new(ResamplingSource::new(source, target_rate)?))
}
