//! Channel count adaptation and interleave/planar conversion
//!
//! Sources deliver interleaved frames while plugins consume one contiguous
//! buffer per channel. Every stage boundary in a composed node goes through
//! the functions here.
//!
//! Channel mapping rules, from `source` to `target` channels:
//! - equal counts: direct copy
//! - upmix: target channel `c` takes source channel `c % source`
//! - downmix: target channel `c` is the mean of source channels
//!   `c, c + target, c + 2 * target, ...`

/// How a frame is remapped between two channel counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMapping {
    Direct,
    Upmix,
    Downmix,
}

impl ChannelMapping {
    /// Select the mapping used between `source` and `target` channel counts
    pub fn between(source: usize, target: usize) -> Self {
        if source == target {
            Self::Direct
        } else if target > source {
            Self::Upmix
        } else {
            Self::Downmix
        }
    }
}

/// Compute target channel `channel` of one frame.
///
/// `sample(c)` returns source channel `c` of the same frame.
#[inline]
fn mapped_sample(
    sample: impl Fn(usize) -> f32,
    channel: usize,
    source_channels: usize,
    target_channels: usize,
) -> f32 {
    if source_channels == 0 {
        return 0.0;
    }
    match ChannelMapping::between(source_channels, target_channels) {
        ChannelMapping::Direct => sample(channel),
        ChannelMapping::Upmix => sample(channel % source_channels),
        ChannelMapping::Downmix => {
            let mut sum = 0.0f32;
            let mut count = 0usize;
            let mut source = channel;
            while source < source_channels {
                sum += sample(source);
                count += 1;
                source += target_channels;
            }
            if count > 0 {
                sum / count as f32
            } else {
                0.0
            }
        }
    }
}

/// Deinterleave `frames` frames of `source_channels`-channel audio into
/// `planar`, adapting to `planar.len()` channels on the way.
///
/// Each planar buffer must hold at least `frames` samples. Samples past
/// `frames` are left untouched.
pub fn deinterleave_adapt<C: AsMut<[f32]>>(
    interleaved: &[f32],
    frames: usize,
    source_channels: usize,
    planar: &mut [C],
) {
    let target_channels = planar.len();
    let frames = if source_channels == 0 {
        frames
    } else {
        frames.min(interleaved.len() / source_channels)
    };

    for frame in 0..frames {
        let base = frame * source_channels;
        for (channel, buffer) in planar.iter_mut().enumerate() {
            buffer.as_mut()[frame] = mapped_sample(
                |c| interleaved[base + c],
                channel,
                source_channels,
                target_channels,
            );
        }
    }
}

/// Interleave the first `frames` samples of every planar buffer into `out`.
///
/// `out` must hold at least `frames * planar.len()` samples.
pub fn interleave_into<C: AsRef<[f32]>>(planar: &[C], frames: usize, out: &mut [f32]) {
    let channels = planar.len();
    for frame in 0..frames {
        for (channel, buffer) in planar.iter().enumerate() {
            out[frame * channels + channel] = buffer.as_ref()[frame];
        }
    }
}

/// Adapt planar `input` to planar `output` over `frames` frames.
///
/// Used by bypassed stages, which still have to honour the plugin's
/// declared output count.
pub fn adapt_planar<I: AsRef<[f32]>, O: AsMut<[f32]>>(
    input: &[I],
    output: &mut [O],
    frames: usize,
) {
    let source_channels = input.len();
    let target_channels = output.len();
    for frame in 0..frames {
        for (channel, buffer) in output.iter_mut().enumerate() {
            buffer.as_mut()[frame] = mapped_sample(
                |c| input[c].as_ref()[frame],
                channel,
                source_channels,
                target_channels,
            );
        }
    }
}

/// Adapt interleaved audio between channel counts without leaving the
/// interleaved layout. Returns the number of samples written to `out`.
pub fn adapt_interleaved(
    input: &[f32],
    source_channels: usize,
    target_channels: usize,
    out: &mut [f32],
) -> usize {
    if source_channels == 0 || target_channels == 0 {
        return 0;
    }
    let frames = (input.len() / source_channels).min(out.len() / target_channels);
    for frame in 0..frames {
        let base = frame * source_channels;
        for channel in 0..target_channels {
            out[frame * target_channels + channel] = mapped_sample(
                |c| input[base + c],
                channel,
                source_channels,
                target_channels,
            );
        }
    }
    frames * target_channels
}

/// Split interleaved samples into one buffer per channel
pub fn deinterleave(interleaved: &[f32], channels: usize) -> Vec<Vec<f32>> {
    if channels == 0 {
        return Vec::new();
    }
    let frames = interleaved.len() / channels;
    let mut planar = vec![vec![0.0f32; frames]; channels];
    deinterleave_adapt(interleaved, frames, channels, &mut planar);
    planar
}

/// Join one buffer per channel into interleaved samples.
///
/// The frame count is the length of the shortest channel.
pub fn interleave<C: AsRef<[f32]>>(planar: &[C]) -> Vec<f32> {
    let frames = planar
        .iter()
        .map(|channel| channel.as_ref().len())
        .min()
        .unwrap_or(0);
    let mut out = vec![0.0f32; frames * planar.len()];
    interleave_into(planar, frames, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_planar(channels: usize, frames: usize) -> Vec<Vec<f32>> {
        let mut rng = rand::thread_rng();
        (0..channels)
            .map(|_| (0..frames).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
            .collect()
    }

    #[test]
    fn test_interleave_round_trip_is_exact() {
        for channels in 1..=8 {
            for frames in [0usize, 1, 7, 512, 1024] {
                let planar = random_planar(channels, frames);
                let interleaved = interleave(&planar);
                assert_eq!(interleaved.len(), channels * frames);
                assert_eq!(deinterleave(&interleaved, channels), planar);
            }
        }
    }

    #[test]
    fn test_interleave_layout() {
        let planar = vec![vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]];
        assert_eq!(interleave(&planar), vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0]);
    }

    #[test]
    fn test_upmix_mono_to_stereo_duplicates() {
        let mono: Vec<f32> = (0..64).map(|i| i as f32 * 0.01).collect();
        let mut planar = vec![vec![0.0f32; 64]; 2];
        deinterleave_adapt(&mono, 64, 1, &mut planar);
        assert_eq!(planar[0], mono);
        assert_eq!(planar[1], mono);
    }

    #[test]
    fn test_upmix_is_cyclic() {
        // 2 -> 5: channels map to 0,1,0,1,0
        let interleaved = vec![0.25, -0.5];
        let mut planar = vec![vec![0.0f32; 1]; 5];
        deinterleave_adapt(&interleaved, 1, 2, &mut planar);
        let got: Vec<f32> = planar.iter().map(|c| c[0]).collect();
        assert_eq!(got, vec![0.25, -0.5, 0.25, -0.5, 0.25]);
    }

    #[test]
    fn test_downmix_four_to_two_averages_strided_channels() {
        let source = random_planar(4, 128);
        let interleaved = interleave(&source);
        let mut planar = vec![vec![0.0f32; 128]; 2];
        deinterleave_adapt(&interleaved, 128, 4, &mut planar);

        for frame in 0..128 {
            let left = (source[0][frame] + source[2][frame]) / 2.0;
            let right = (source[1][frame] + source[3][frame]) / 2.0;
            assert_eq!(planar[0][frame], left);
            assert_eq!(planar[1][frame], right);
        }
    }

    #[test]
    fn test_downmix_uneven_groups() {
        // 3 -> 2: channel 0 = mean(0, 2), channel 1 = source 1
        let interleaved = vec![1.0, 5.0, 3.0];
        let mut planar = vec![vec![0.0f32; 1]; 2];
        deinterleave_adapt(&interleaved, 1, 3, &mut planar);
        assert_eq!(planar[0][0], 2.0);
        assert_eq!(planar[1][0], 5.0);
    }

    #[test]
    fn test_deinterleave_adapt_leaves_tail_untouched() {
        let interleaved = vec![1.0, 2.0];
        let mut planar = vec![vec![9.0f32; 4]; 1];
        deinterleave_adapt(&interleaved, 2, 1, &mut planar);
        assert_eq!(planar[0], vec![1.0, 2.0, 9.0, 9.0]);
    }

    #[test]
    fn test_adapt_planar_matches_interleaved_path() {
        let source = random_planar(3, 32);
        let mut via_planar = vec![vec![0.0f32; 32]; 2];
        adapt_planar(&source, &mut via_planar, 32);

        let mut via_interleaved = vec![0.0f32; 64];
        let written = adapt_interleaved(&interleave(&source), 3, 2, &mut via_interleaved);
        assert_eq!(written, 64);
        assert_eq!(interleave(&via_planar), via_interleaved);
    }

    #[test]
    fn test_mapping_selection() {
        assert_eq!(ChannelMapping::between(2, 2), ChannelMapping::Direct);
        assert_eq!(ChannelMapping::between(1, 2), ChannelMapping::Upmix);
        assert_eq!(ChannelMapping::between(6, 2), ChannelMapping::Downmix);
    }
}
