//! Audio device enumeration and live capture

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, Stream, StreamConfig};
use tracing::{error, info};

use super::error::AudioError;
use super::source::{capture_queue, CaptureSink, CaptureSource};

/// Unique identifier for an audio device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

/// Information about an audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device identifier
    pub id: DeviceId,
    /// Display name
    pub name: String,
    /// Supported sample rates (Hz)
    pub supported_sample_rates: Vec<u32>,
    /// Supported channel counts
    pub supported_channels: Vec<u16>,
    /// Whether this is the default device
    pub is_default: bool,
}

/// List available input (capture) devices
pub fn list_input_devices() -> Vec<AudioDevice> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    host.input_devices()
        .map(|devices| {
            devices
                .filter_map(|device| describe(&device, default_name.as_deref(), true))
                .collect()
        })
        .unwrap_or_default()
}

/// List available output (playback) devices
pub fn list_output_devices() -> Vec<AudioDevice> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    host.output_devices()
        .map(|devices| {
            devices
                .filter_map(|device| describe(&device, default_name.as_deref(), false))
                .collect()
        })
        .unwrap_or_default()
}

fn describe(device: &cpal::Device, default_name: Option<&str>, input: bool) -> Option<AudioDevice> {
    let name = device.name().ok()?;
    let (sample_rates, channels) = get_device_capabilities(device, input);
    Some(AudioDevice {
        id: DeviceId(name.clone()),
        is_default: default_name == Some(name.as_str()),
        name,
        supported_sample_rates: sample_rates,
        supported_channels: channels,
    })
}

/// Get supported sample rates and channel counts for a device
fn get_device_capabilities(device: &cpal::Device, input: bool) -> (Vec<u32>, Vec<u16>) {
    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();

    let configs: Vec<_> = if input {
        device.supported_input_configs().into_iter().flatten().collect()
    } else {
        device.supported_output_configs().into_iter().flatten().collect()
    };

    for config in configs {
        for rate in &[22050u32, 44100, 48000, 88200, 96000, 192000] {
            if *rate >= config.min_sample_rate().0
                && *rate <= config.max_sample_rate().0
                && !sample_rates.contains(rate)
            {
                sample_rates.push(*rate);
            }
        }
        let ch = config.channels();
        if !channels.contains(&ch) {
            channels.push(ch);
        }
    }

    sample_rates.sort();
    channels.sort();
    (sample_rates, channels)
}

/// Resolve an input device by name, or the default one
pub fn find_input_device(device_id: Option<&DeviceId>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match device_id {
        Some(id) => host
            .input_devices()
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?
            .find(|d| d.name().ok().as_ref() == Some(&id.0))
            .ok_or_else(|| AudioError::DeviceNotFound(id.0.clone())),
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".into())),
    }
}

/// Resolve an output device by name, or the default one
pub fn find_output_device(device_id: Option<&DeviceId>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match device_id {
        Some(id) => host
            .output_devices()
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?
            .find(|d| d.name().ok().as_ref() == Some(&id.0))
            .ok_or_else(|| AudioError::DeviceNotFound(id.0.clone())),
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".into())),
    }
}

/// A running capture stream feeding a capture queue.
///
/// Capture stops when this is dropped.
pub struct CaptureDevice {
    _stream: Stream,
    name: String,
    channels: usize,
    sample_rate: u32,
}

impl CaptureDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Start capturing from `device_id` at the device's native format.
///
/// Samples are converted to `f32` in the callback and pushed into a queue
/// holding `capacity` of device-rate audio, never less than `min_frames`.
/// While `paused` is set they are dropped.
pub fn open_capture(
    device_id: Option<&DeviceId>,
    capacity: Duration,
    min_frames: usize,
    paused: Arc<AtomicBool>,
) -> Result<(CaptureDevice, CaptureSource), AudioError> {
    let device = find_input_device(device_id)?;
    let name = device.name().unwrap_or_default();
    let supported = device
        .default_input_config()
        .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?;

    let channels = supported.channels() as usize;
    let sample_rate = supported.sample_rate().0;
    let config: StreamConfig = supported.config();
    let queue_frames = capture_frames(capacity, sample_rate, min_frames);
    let (sink, source) = capture_queue(channels, sample_rate, queue_frames, paused)?;

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_capture::<f32>(&device, &config, sink),
        SampleFormat::I16 => build_capture::<i16>(&device, &config, sink),
        SampleFormat::U16 => build_capture::<u16>(&device, &config, sink),
        SampleFormat::I32 => build_capture::<i32>(&device, &config, sink),
        other => Err(AudioError::UnsupportedConfig(format!(
            "Capture sample format {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::Streaming(e.to_string()))?;

    info!(
        "Capturing from {} ({} channels, {} Hz)",
        name, channels, sample_rate
    );

    Ok((
        CaptureDevice {
            _stream: stream,
            name,
            channels,
            sample_rate,
        },
        source,
    ))
}

/// Frames needed to hold `capacity` at `sample_rate`
fn capture_frames(capacity: Duration, sample_rate: u32, min_frames: usize) -> usize {
    let frames = (capacity.as_secs_f64() * sample_rate as f64).ceil() as usize;
    frames.max(min_frames)
}

fn build_capture<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut sink: CaptureSink,
) -> Result<Stream, AudioError>
where
    T: SizedSample,
    f32: cpal::FromSample<T>,
{
    let mut converted: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                converted.clear();
                converted.extend(data.iter().map(|s| s.to_sample::<f32>()));
                sink.push(&converted);
            },
            |err| error!("Capture stream error: {:?}", err),
            None,
        )
        .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices_does_not_panic() {
        // Actual device availability depends on the system
        let _inputs = list_input_devices();
        let _outputs = list_output_devices();
    }

    #[test]
    fn test_unknown_device_not_found() {
        let id = DeviceId("definitely-not-a-real-device".to_string());
        assert!(find_input_device(Some(&id)).is_err());
        assert!(find_output_device(Some(&id)).is_err());
    }

    #[test]
    fn test_capture_frames_follow_device_rate() {
        let capacity = Duration::from_millis(500);
        assert_eq!(capture_frames(capacity, 48000, 256), 24000);
        assert_eq!(capture_frames(capacity, 96000, 256), 48000);
        assert_eq!(capture_frames(Duration::from_millis(1), 8000, 256), 256);
    }
}
