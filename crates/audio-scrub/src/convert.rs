//! Output conversion: channel mapping plus quantization.
//!
//! Decoded frames arrive as interleaved `f32` at the stream's native
//! rate; pages store bytes in the selected [`TargetFormat`]. The rate is
//! never changed here (reads are sample-accurate against the native
//! rate), so conversion is mixing and requantization only.

use crate::error::OpenError;
use crate::format::{ChannelLayout, SampleFormat, TargetFormat};

/// What the decoder is currently producing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputSpec {
    pub layout: ChannelLayout,
    pub rate: u32,
}

/// Converts decoded `f32` frames into cache bytes.
///
/// `configure` runs once at open and again for every decoded frame,
/// since some streams switch parameters mid-file; it is a no-op when
/// nothing changed. After a successful `configure`, `convert` must not
/// fail.
pub trait Resampler {
    fn configure(&mut self, input: InputSpec, target: &TargetFormat) -> Result<(), OpenError>;

    /// Convert `frames` positions from `src` into `dst`.
    ///
    /// `src` holds at least `frames × in-channels` interleaved samples;
    /// `dst` holds exactly `frames × frame_size` bytes, little-endian.
    fn convert(&mut self, src: &[f32], frames: usize, dst: &mut [u8]);
}

/// Built-in converter with best-effort channel mapping:
/// - mono fans out to every output channel
/// - stereo to mono averages L/R
/// - equal counts pass through
/// - anything else clamps to the available source channels
#[derive(Debug)]
pub struct PcmConverter {
    current: Option<(InputSpec, TargetFormat)>,
    in_channels: usize,
    out_channels: usize,
    format: SampleFormat,
}

impl Default for PcmConverter {
    fn default() -> Self {
        PcmConverter {
            current: None,
            in_channels: 0,
            out_channels: 0,
            format: SampleFormat::F32,
        }
    }
}

impl PcmConverter {
    pub fn new() -> PcmConverter {
        PcmConverter::default()
    }
}

impl Resampler for PcmConverter {
    fn configure(&mut self, input: InputSpec, target: &TargetFormat) -> Result<(), OpenError> {
        if self.current == Some((input, *target)) {
            return Ok(());
        }

        let in_channels = input.layout.channels() as usize;
        let out_channels = target.channels() as usize;
        if in_channels == 0 || out_channels == 0 {
            return Err(OpenError::Converter(format!(
                "cannot map {in_channels} -> {out_channels} channels"
            )));
        }
        if input.rate == 0 || target.sample_rate == 0 {
            return Err(OpenError::Converter("zero sample rate".into()));
        }

        tracing::debug!(
            in_channels,
            out_channels,
            format = ?target.format,
            "converter configured"
        );

        self.in_channels = in_channels;
        self.out_channels = out_channels;
        self.format = target.format;
        self.current = Some((input, *target));
        Ok(())
    }

    fn convert(&mut self, src: &[f32], frames: usize, dst: &mut [u8]) {
        if self.in_channels == 0 {
            return;
        }
        let ic = self.in_channels;
        let oc = self.out_channels;
        let bps = self.format.bytes_per_sample();

        let mut w = 0;
        for f in 0..frames {
            let frame = &src[f * ic..(f + 1) * ic];
            for ch in 0..oc {
                let x = mixed(frame, oc, ch);
                write_sample(self.format, x, &mut dst[w..w + bps]);
                w += bps;
            }
        }
    }
}

/// One output sample for `ch` from one input frame.
fn mixed(frame: &[f32], out_channels: usize, ch: usize) -> f32 {
    let ic = frame.len();
    match (ic, out_channels) {
        (1, _) => frame[0],
        (2, 1) => 0.5 * (frame[0] + frame[1]),
        (n, m) if n == m => frame[ch],
        _ => frame[ch.min(ic - 1)],
    }
}

fn write_sample(format: SampleFormat, x: f32, dst: &mut [u8]) {
    match format {
        SampleFormat::U8 => {
            dst[0] = (x.clamp(-1.0, 1.0) * 127.0 + 128.0) as u8;
        }
        SampleFormat::S16 => {
            let v = (x.clamp(-1.0, 1.0) * 32767.0) as i16;
            dst[..2].copy_from_slice(&v.to_le_bytes());
        }
        SampleFormat::F32 => {
            dst[..4].copy_from_slice(&x.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(layout: ChannelLayout, format: SampleFormat) -> TargetFormat {
        TargetFormat {
            layout,
            format,
            sample_rate: 48_000,
        }
    }

    fn configured(input_layout: ChannelLayout, t: &TargetFormat) -> PcmConverter {
        let mut c = PcmConverter::new();
        c.configure(
            InputSpec {
                layout: input_layout,
                rate: 48_000,
            },
            t,
        )
        .unwrap();
        c
    }

    #[test]
    fn stereo_passthrough_s16() {
        let t = target(ChannelLayout::STEREO, SampleFormat::S16);
        let mut c = configured(ChannelLayout::STEREO, &t);
        let src = [0.5f32, -0.5, 1.0, -1.0];
        let mut dst = vec![0u8; 8];
        c.convert(&src, 2, &mut dst);
        let s = |i: usize| i16::from_le_bytes([dst[i * 2], dst[i * 2 + 1]]);
        assert_eq!(s(0), 16383);
        assert_eq!(s(1), -16383);
        assert_eq!(s(2), 32767);
        assert_eq!(s(3), -32767);
    }

    #[test]
    fn stereo_to_mono_averages() {
        let t = target(ChannelLayout::MONO, SampleFormat::F32);
        let mut c = configured(ChannelLayout::STEREO, &t);
        let src = [1.0f32, 0.0, -0.5, 0.5];
        let mut dst = vec![0u8; 8];
        c.convert(&src, 2, &mut dst);
        let v0 = f32::from_le_bytes([dst[0], dst[1], dst[2], dst[3]]);
        let v1 = f32::from_le_bytes([dst[4], dst[5], dst[6], dst[7]]);
        assert_eq!(v0, 0.5);
        assert_eq!(v1, 0.0);
    }

    #[test]
    fn mono_fans_out_to_stereo() {
        let t = target(ChannelLayout::STEREO, SampleFormat::F32);
        let mut c = configured(ChannelLayout::MONO, &t);
        let src = [0.25f32];
        let mut dst = vec![0u8; 8];
        c.convert(&src, 1, &mut dst);
        let l = f32::from_le_bytes([dst[0], dst[1], dst[2], dst[3]]);
        let r = f32::from_le_bytes([dst[4], dst[5], dst[6], dst[7]]);
        assert_eq!(l, 0.25);
        assert_eq!(r, 0.25);
    }

    #[test]
    fn wide_to_downmix_takes_front_pair() {
        let t = target(ChannelLayout::STEREO_DOWNMIX, SampleFormat::F32);
        let mut c = configured(ChannelLayout(0x3F), &t); // 5.1
        let src = [0.1f32, 0.2, 0.3, 0.4, 0.5, 0.6];
        let mut dst = vec![0u8; 8];
        c.convert(&src, 1, &mut dst);
        let l = f32::from_le_bytes([dst[0], dst[1], dst[2], dst[3]]);
        let r = f32::from_le_bytes([dst[4], dst[5], dst[6], dst[7]]);
        assert_eq!(l, 0.1);
        assert_eq!(r, 0.2);
    }

    #[test]
    fn u8_silence_is_midpoint() {
        let t = target(ChannelLayout::MONO, SampleFormat::U8);
        let mut c = configured(ChannelLayout::MONO, &t);
        let src = [0.0f32, 1.0, -1.0];
        let mut dst = vec![0u8; 3];
        c.convert(&src, 3, &mut dst);
        assert_eq!(dst[0], 0x80);
        assert_eq!(dst[1], 255);
        assert_eq!(dst[2], 1);
    }

    #[test]
    fn configure_rejects_empty_layout() {
        let t = target(ChannelLayout::STEREO, SampleFormat::S16);
        let mut c = PcmConverter::new();
        let err = c.configure(
            InputSpec {
                layout: ChannelLayout(0),
                rate: 48_000,
            },
            &t,
        );
        assert!(err.is_err());
    }

    #[test]
    fn reconfigure_same_spec_is_a_noop() {
        let t = target(ChannelLayout::STEREO, SampleFormat::S16);
        let mut c = configured(ChannelLayout::STEREO, &t);
        c.configure(
            InputSpec {
                layout: ChannelLayout::STEREO,
                rate: 48_000,
            },
            &t,
        )
        .unwrap();
        assert_eq!(c.in_channels, 2);
    }
}
