//! Output transport boundary and the cpal-backed playback transport
//!
//! The streaming loop hands the transport interleaved `f32` samples encoded
//! as little-endian bytes. The transport owns a bounded buffer drained by
//! the device callback and reports how much audio is still buffered, which
//! the loop uses for backpressure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use tracing::{debug, error, info, warn};

use super::device::{find_output_device, DeviceId};
use super::error::AudioError;

/// Bytes per encoded sample
pub const BYTES_PER_SAMPLE: usize = std::mem::size_of::<f32>();

/// Destination for processed audio
pub trait OutputTransport {
    fn channels(&self) -> usize;

    fn sample_rate(&self) -> u32;

    /// Queue interleaved little-endian `f32` bytes for playback
    fn enqueue(&mut self, bytes: &[u8]) -> Result<(), AudioError>;

    /// Audio queued but not yet played
    fn buffered_duration(&self) -> Duration;

    fn play(&mut self) -> Result<(), AudioError>;

    fn pause(&mut self) -> Result<(), AudioError>;

    /// Stop playback and discard anything still buffered
    fn stop(&mut self);
}

/// Creates the transport for a session once the node's channel count and
/// rate are known. Runs on the streaming thread.
pub type TransportFactory =
    Box<dyn FnOnce(usize, u32) -> Result<Box<dyn OutputTransport>, AudioError> + Send>;

/// Encode interleaved samples as little-endian bytes into `out`
pub fn samples_to_bytes(samples: &[f32], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(samples.len() * BYTES_PER_SAMPLE);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
}

/// Decode little-endian `f32` bytes. A trailing partial sample is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

/// Duration of `samples` interleaved samples
pub fn samples_duration(samples: usize, channels: usize, sample_rate: u32) -> Duration {
    if channels == 0 || sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(samples as f64 / channels as f64 / sample_rate as f64)
}

const ENQUEUE_RETRY: Duration = Duration::from_millis(5);
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Playback through a cpal output stream
pub struct CpalOutput {
    stream: Stream,
    producer: HeapProd<f32>,
    channels: usize,
    sample_rate: u32,
    playing: bool,
    stream_error: Arc<Mutex<Option<String>>>,
    flush: Arc<AtomicBool>,
    scratch: Vec<f32>,
}

impl CpalOutput {
    /// Open `device_id` (or the default output) at `sample_rate`.
    ///
    /// `channels` is used when the device supports it at that rate;
    /// otherwise the first channel count the device offers is chosen and the
    /// caller adapts to [`OutputTransport::channels`]. `capacity` bounds the
    /// internal buffer.
    pub fn open(
        device_id: Option<&DeviceId>,
        channels: usize,
        sample_rate: u32,
        capacity: Duration,
    ) -> Result<Self, AudioError> {
        let device = find_output_device(device_id)?;
        let device_name = device.name().unwrap_or_default();
        let channels = negotiate_channels(&device, channels, sample_rate)?;

        let stream_config = StreamConfig {
            channels: channels as u16,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let capacity_samples =
            ((capacity.as_secs_f64() * sample_rate as f64) as usize).max(1) * channels;
        let rb = HeapRb::<f32>::new(capacity_samples);
        let (producer, mut consumer) = rb.split();

        let flush = Arc::new(AtomicBool::new(false));
        let flush_clone = flush.clone();
        let stream_error = Arc::new(Mutex::new(None));
        let stream_error_clone = stream_error.clone();

        let err_fn = move |err: cpal::StreamError| {
            error!("Playback stream error: {:?}", err);
            *stream_error_clone.lock() = Some(err.to_string());
        };

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if flush_clone.swap(false, Ordering::AcqRel) {
                        consumer.clear();
                    }
                    let n = consumer.pop_slice(data);
                    data[n..].fill(0.0);
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::Streaming(e.to_string()))?;

        // Start paused; the streaming loop calls play()
        stream
            .pause()
            .map_err(|e| AudioError::Streaming(e.to_string()))?;

        info!(
            "Opened output on {} ({} channels, {} Hz, {:?} buffer)",
            device_name, channels, sample_rate, capacity
        );

        Ok(Self {
            stream,
            producer,
            channels,
            sample_rate,
            playing: false,
            stream_error,
            flush,
            scratch: Vec::new(),
        })
    }

    fn check_stream(&self) -> Result<(), AudioError> {
        match self.stream_error.lock().take() {
            Some(message) => Err(AudioError::Streaming(message)),
            None => Ok(()),
        }
    }
}

fn negotiate_channels(
    device: &cpal::Device,
    wanted: usize,
    sample_rate: u32,
) -> Result<usize, AudioError> {
    let configs: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?
        .filter(|c| {
            c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate().0 <= sample_rate
                && c.max_sample_rate().0 >= sample_rate
        })
        .collect();

    if configs.iter().any(|c| c.channels() as usize == wanted) {
        return Ok(wanted);
    }
    match configs.first() {
        Some(config) => {
            debug!(
                "Output device cannot play {} channels, using {}",
                wanted,
                config.channels()
            );
            Ok(config.channels() as usize)
        }
        None => Err(AudioError::UnsupportedConfig(format!(
            "No f32 output configuration at {} Hz",
            sample_rate
        ))),
    }
}

impl OutputTransport for CpalOutput {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn enqueue(&mut self, bytes: &[u8]) -> Result<(), AudioError> {
        self.check_stream()?;
        self.scratch.clear();
        self.scratch.extend(bytes_to_samples(bytes));

        let mut offset = 0;
        let started = Instant::now();
        while offset < self.scratch.len() {
            offset += self.producer.push_slice(&self.scratch[offset..]);
            if offset == self.scratch.len() {
                break;
            }
            if !self.playing || started.elapsed() > ENQUEUE_TIMEOUT {
                return Err(AudioError::Streaming(format!(
                    "Output buffer full, {} samples not accepted",
                    self.scratch.len() - offset
                )));
            }
            thread::sleep(ENQUEUE_RETRY);
            self.check_stream()?;
        }
        Ok(())
    }

    fn buffered_duration(&self) -> Duration {
        samples_duration(self.producer.occupied_len(), self.channels, self.sample_rate)
    }

    fn play(&mut self) -> Result<(), AudioError> {
        self.stream
            .play()
            .map_err(|e| AudioError::Streaming(e.to_string()))?;
        self.playing = true;
        debug!("Output playing");
        Ok(())
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        self.stream
            .pause()
            .map_err(|e| AudioError::Streaming(e.to_string()))?;
        self.playing = false;
        debug!("Output paused");
        Ok(())
    }

    fn stop(&mut self) {
        self.flush.store(true, Ordering::Release);
        if let Err(e) = self.stream.pause() {
            warn!("Failed to pause output stream on stop: {}", e);
        }
        self.playing = false;
        info!("Output stopped");
    }
}
