//! Output format selection and the wave-format descriptor handed to hosts.
//!
//! A stream decodes to one of three interleaved output formats (`u8`,
//! `i16`, `f32`), chosen from the codec's native format and optionally
//! narrowed by a host request. The resulting [`WaveFormatExt`] mirrors
//! WAVEFORMATEX/WAVEFORMATEXTENSIBLE byte for byte so editing hosts and
//! WAV writers can consume it directly.

use serde::Serialize;

pub const WAVE_FORMAT_PCM: u16 = 0x0001;
pub const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Speaker-position bits meaningful to `dwChannelMask`.
const CHANNEL_MASK_ALL: u32 = 0x3FFFF;

const SUBTYPE_PCM: [u8; 16] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
];
const SUBTYPE_IEEE_FLOAT: [u8; 16] = [
    0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
];

/// Cache/output sample format. Decoded audio is converted into one of
/// these before it is written to a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S16,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::F32 => 4,
        }
    }

    pub fn bits_per_sample(self) -> u16 {
        self.bytes_per_sample() as u16 * 8
    }

    /// Byte value that renders as silence: 0x80 for unsigned 8-bit, 0 otherwise.
    pub fn silence_byte(self) -> u8 {
        match self {
            SampleFormat::U8 => 0x80,
            _ => 0,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, SampleFormat::F32)
    }
}

/// Channel layout as a speaker-position bitmask (WAVE/FFmpeg bit order).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelLayout(pub u64);

impl ChannelLayout {
    pub const MONO: ChannelLayout = ChannelLayout(0x4);
    pub const STEREO: ChannelLayout = ChannelLayout(0x3);
    /// Dedicated downmix pair (`SPEAKER_STEREO_LEFT|RIGHT`), used when a
    /// host asks for two channels out of a wider layout.
    pub const STEREO_DOWNMIX: ChannelLayout = ChannelLayout(0x6000_0000);

    pub fn channels(self) -> u32 {
        self.0.count_ones()
    }

    pub fn mask(self) -> u64 {
        self.0
    }

    /// Conventional layout for a bare channel count, for streams that
    /// report no speaker positions.
    pub fn default_for_count(n: u32) -> ChannelLayout {
        ChannelLayout(match n {
            1 => 0x4,         // mono
            2 => 0x3,         // stereo
            3 => 0xB,         // 2.1
            4 => 0x107,       // 4.0
            5 => 0x37,        // 5.0 (back)
            6 => 0x3F,        // 5.1 (back)
            7 => 0x70F,       // 6.1
            8 => 0x63F,       // 7.1
            n => (1u64 << n.min(63)) - 1,
        })
    }
}

/// The format samples have once they are in the cache: layout, sample
/// format, and the stream's native rate (reads never resample).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetFormat {
    pub layout: ChannelLayout,
    pub format: SampleFormat,
    pub sample_rate: u32,
}

impl TargetFormat {
    pub fn channels(&self) -> u32 {
        self.layout.channels()
    }

    /// Bytes per frame (all channels of one sample position).
    pub fn frame_size(&self) -> usize {
        self.channels() as usize * self.format.bytes_per_sample()
    }

    /// Choose the output format for a stream.
    ///
    /// Without a request this is the native layout and the nearest of
    /// U8/S16/F32 to the codec's own sample format. A request narrows it:
    /// - 1 channel forces mono; 2 channels keeps mono/stereo sources as
    ///   they are and maps anything wider to the downmix pair
    /// - 8 bits forces U8; 16 bits forces S16 unless U8 already won
    pub fn derive(
        source_layout: ChannelLayout,
        default_format: SampleFormat,
        sample_rate: u32,
        request: Option<TargetRequest>,
    ) -> TargetFormat {
        let mut layout = source_layout;
        let mut format = default_format;

        if let Some(req) = request {
            if req.channels == 1 {
                layout = ChannelLayout::MONO;
            } else if req.channels == 2 {
                match layout {
                    ChannelLayout::MONO | ChannelLayout::STEREO => {}
                    _ => layout = ChannelLayout::STEREO_DOWNMIX,
                }
            }

            if req.bits_per_sample == 8 {
                format = SampleFormat::U8;
            }
            if req.bits_per_sample == 16 && format != SampleFormat::U8 {
                format = SampleFormat::S16;
            }
        }

        TargetFormat {
            layout,
            format,
            sample_rate,
        }
    }
}

/// Host constraints on the output format. Zero fields are ignored, as are
/// channel counts other than 1/2 and bit depths other than 8/16.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TargetRequest {
    pub channels: u16,
    pub bits_per_sample: u16,
}

/// WAVEFORMATEX / WAVEFORMATEXTENSIBLE mirror.
///
/// The extension fields are meaningful only when `format_tag` is
/// [`WAVE_FORMAT_EXTENSIBLE`], which is selected for more than 16 bits
/// per sample or more than two channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaveFormatExt {
    pub format_tag: u16,
    pub channels: u16,
    pub samples_per_sec: u32,
    pub avg_bytes_per_sec: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    pub cb_size: u16,
    pub valid_bits_per_sample: u16,
    pub channel_mask: u32,
    pub sub_format: [u8; 16],
}

impl WaveFormatExt {
    pub fn from_target(t: &TargetFormat) -> WaveFormatExt {
        let channels = t.channels() as u16;
        let bits = t.format.bits_per_sample();
        let block_align = channels * (bits / 8);
        let mut w = WaveFormatExt {
            format_tag: WAVE_FORMAT_PCM,
            channels,
            samples_per_sec: t.sample_rate,
            avg_bytes_per_sec: t.sample_rate * block_align as u32,
            block_align,
            bits_per_sample: bits,
            cb_size: 0,
            valid_bits_per_sample: 0,
            channel_mask: 0,
            sub_format: [0; 16],
        };

        if bits > 16 || channels > 2 {
            w.format_tag = WAVE_FORMAT_EXTENSIBLE;
            w.cb_size = 22;
            w.valid_bits_per_sample = bits;
            w.channel_mask = t.layout.mask() as u32 & CHANNEL_MASK_ALL;
            w.sub_format = if t.format.is_float() {
                SUBTYPE_IEEE_FLOAT
            } else {
                SUBTYPE_PCM
            };
        }

        w
    }

    /// Serialized size: 18 bytes of WAVEFORMATEX plus the extension.
    pub fn byte_len(&self) -> usize {
        18 + self.cb_size as usize
    }

    /// Little-endian wire layout, suitable for a WAV `fmt ` chunk or a
    /// host format negotiation buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        out.extend_from_slice(&self.format_tag.to_le_bytes());
        out.extend_from_slice(&self.channels.to_le_bytes());
        out.extend_from_slice(&self.samples_per_sec.to_le_bytes());
        out.extend_from_slice(&self.avg_bytes_per_sec.to_le_bytes());
        out.extend_from_slice(&self.block_align.to_le_bytes());
        out.extend_from_slice(&self.bits_per_sample.to_le_bytes());
        out.extend_from_slice(&self.cb_size.to_le_bytes());
        if self.format_tag == WAVE_FORMAT_EXTENSIBLE {
            out.extend_from_slice(&self.valid_bits_per_sample.to_le_bytes());
            out.extend_from_slice(&self.channel_mask.to_le_bytes());
            out.extend_from_slice(&self.sub_format);
        }
        out
    }
}
