//! Decoded-file sources using symphonia
//!
//! Files are decoded packet by packet as the streaming loop pulls, so memory
//! use stays flat regardless of file length.

use std::fs::File;
use std::path::{Path, PathBuf};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info, warn};

use super::error::AudioError;
use super::source::SampleSource;

/// File extensions accepted as sources
pub const SUPPORTED_EXTENSIONS: &[&str] = &["wav", "mp3", "flac", "ogg"];

/// Whether `path` has one of the [`SUPPORTED_EXTENSIONS`]
pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Streaming decoder over one audio file
pub struct FileSource {
    path: PathBuf,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    pending_pos: usize,
    finished: bool,
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("path", &self.path)
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl FileSource {
    /// Open `path` for decoding.
    ///
    /// Extensions outside [`SUPPORTED_EXTENSIONS`] and containers symphonia
    /// cannot recognize fail with [`AudioError::UnsupportedFormat`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AudioError> {
        let path = path.as_ref();
        if !is_supported(path) {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} (supported: {})",
                path.display(),
                SUPPORTED_EXTENSIONS.join(", ")
            )));
        }

        let file = File::open(path)
            .map_err(|e| AudioError::Decode(format!("Failed to open {}: {}", path.display(), e)))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| {
                AudioError::UnsupportedFormat(format!("{}: {}", path.display(), e))
            })?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AudioError::Decode(format!("No audio track in {}", path.display())))?;

        let track_id = track.id;
        let channels = track.codec_params.channels.map_or(0, |c| c.count());
        let sample_rate = track.codec_params.sample_rate.unwrap_or(0);

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| AudioError::UnsupportedFormat(format!("{}: {}", path.display(), e)))?;

        let mut source = Self {
            path: path.to_path_buf(),
            format,
            decoder,
            track_id,
            channels,
            sample_rate,
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
        };

        // Some containers only reveal the layout once the first packet decodes
        if source.channels == 0 || source.sample_rate == 0 {
            source.decode_next();
        }
        if source.channels == 0 || source.sample_rate == 0 {
            return Err(AudioError::Decode(format!(
                "Cannot determine channel layout of {}",
                path.display()
            )));
        }

        info!(
            "Opened {} ({} channels, {} Hz)",
            path.display(),
            source.channels,
            source.sample_rate
        );
        Ok(source)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode the next packet of our track into `pending`.
    /// Returns false at end of stream.
    fn decode_next(&mut self) -> bool {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    debug!("Reached end of {}", self.path.display());
                    self.finished = true;
                    return false;
                }
                Err(SymphoniaError::ResetRequired) => {
                    warn!("Stream reset required in {}, stopping", self.path.display());
                    self.finished = true;
                    return false;
                }
                Err(e) => {
                    warn!("Error reading packet from {}: {}", self.path.display(), e);
                    self.finished = true;
                    return false;
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    if self.channels == 0 {
                        self.channels = spec.channels.count();
                    }
                    if self.sample_rate == 0 {
                        self.sample_rate = spec.rate;
                    }
                    if decoded.frames() == 0 {
                        continue;
                    }
                    let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buffer.copy_interleaved_ref(decoded);
                    self.pending.clear();
                    self.pending.extend_from_slice(buffer.samples());
                    self.pending_pos = 0;
                    return true;
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("Skipping corrupt packet in {}: {}", self.path.display(), e);
                    continue;
                }
                Err(e) => {
                    warn!("Decoder failed on {}: {}", self.path.display(), e);
                    self.finished = true;
                    return false;
                }
            }
        }
    }
}

impl SampleSource for FileSource {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> usize {
        let wanted = (buf.len() / self.channels) * self.channels;
        let mut written = 0;
        while written < wanted {
            if self.pending_pos >= self.pending.len() {
                if self.finished || !self.decode_next() {
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
}
