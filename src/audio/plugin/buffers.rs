//! Fixed-size per-plugin sample arena
//!
//! Each plugin instance owns one arena holding `block_size` samples for every
//! input and output channel the plugin declared at load time. The arena is
//! sized once and never grows; callers only see bounds-checked slices.

use super::AudioError;

/// Owned input/output channel buffers for one plugin
#[derive(Debug)]
pub struct NativeBuffers {
    block_size: usize,
    inputs: Vec<Box<[f32]>>,
    outputs: Vec<Box<[f32]>>,
}

impl NativeBuffers {
    /// Allocate zeroed buffers for `inputs` + `outputs` channels.
    ///
    /// Fails with [`AudioError::BufferAllocation`] instead of aborting when
    /// the allocator refuses.
    pub fn new(inputs: usize, outputs: usize, block_size: usize) -> Result<Self, AudioError> {
        if block_size == 0 {
            return Err(AudioError::InvalidArgument(
                "Block size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            block_size,
            inputs: allocate_channels(inputs, block_size)?,
            outputs: allocate_channels(outputs, block_size)?,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Input channel `channel`, if it exists
    pub fn input(&self, channel: usize) -> Option<&[f32]> {
        self.inputs.get(channel).map(|b| &b[..])
    }

    /// Mutable input channel `channel`, if it exists
    pub fn input_mut(&mut self, channel: usize) -> Option<&mut [f32]> {
        self.inputs.get_mut(channel).map(|b| &mut b[..])
    }

    /// Output channel `channel`, if it exists
    pub fn output(&self, channel: usize) -> Option<&[f32]> {
        self.outputs.get(channel).map(|b| &b[..])
    }

    /// Copy `data` into the start of input channel `channel`.
    ///
    /// At most `block_size` samples are copied; the rest of the channel is
    /// zeroed.
    pub fn write_input(&mut self, channel: usize, data: &[f32]) -> Result<(), AudioError> {
        let block_size = self.block_size;
        let buffer = self.input_mut(channel).ok_or_else(|| {
            AudioError::InvalidArgument(format!("Input channel {} out of range", channel))
        })?;
        let n = data.len().min(block_size);
        buffer[..n].copy_from_slice(&data[..n]);
        buffer[n..].fill(0.0);
        Ok(())
    }

    /// Copy output channel `channel` into `dest` (up to `block_size` samples)
    pub fn read_output(&self, channel: usize, dest: &mut [f32]) -> Result<usize, AudioError> {
        let buffer = self.output(channel).ok_or_else(|| {
            AudioError::InvalidArgument(format!("Output channel {} out of range", channel))
        })?;
        let n = dest.len().min(buffer.len());
        dest[..n].copy_from_slice(&buffer[..n]);
        Ok(n)
    }

    /// Borrow every input immutably and every output mutably at once, the
    /// shape a native `process` call needs.
    pub fn split(&mut self) -> (Vec<&[f32]>, Vec<&mut [f32]>) {
        let inputs = self.inputs.iter().map(|b| &b[..]).collect();
        let outputs = self.outputs.iter_mut().map(|b| &mut b[..]).collect();
        (inputs, outputs)
    }

    /// Zero every channel
    pub fn clear(&mut self) {
        for buffer in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            buffer.fill(0.0);
        }
    }
}

fn allocate_channels(count: usize, block_size: usize) -> Result<Vec<Box<[f32]>>, AudioError> {
    let mut channels = Vec::new();
    channels
        .try_reserve_exact(count)
        .map_err(|e| AudioError::BufferAllocation(e.to_string()))?;
    for _ in 0..count {
        let mut samples: Vec<f32> = Vec::new();
        samples
            .try_reserve_exact(block_size)
            .map_err(|e| AudioError::BufferAllocation(e.to_string()))?;
        samples.resize(block_size, 0.0);
        channels.push(samples.into_boxed_slice());
    }
    Ok(channels)
}
