//! The demuxer seam.
//!
//! Everything the cache engine knows about containers and codecs goes
//! through [`Demuxer`]: a packet pump with decode, seek and flush. The
//! production implementation sits in [`crate::media`]; tests drive the
//! engine with a scripted stand-in.

use crate::error::DemuxError;
use crate::format::{ChannelLayout, SampleFormat};

/// Rational mapping from container ticks to sample positions.
///
/// Built by reducing `sample_rate × container_time_base`, so one tick is
/// `num/den` samples. When the container time base is derived from the
/// sample rate this reduces to an integer (`den == 1`) and packet
/// timestamps identify sample positions exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i64,
    pub den: i64,
}

impl TimeBase {
    pub fn from_container(tb_num: i64, tb_den: i64, sample_rate: u32) -> TimeBase {
        let num = i64::from(sample_rate) * tb_num;
        let g = gcd(num.abs().max(1), tb_den.abs().max(1));
        TimeBase {
            num: num / g,
            den: tb_den / g,
        }
    }

    /// Ticks are exact sample positions.
    pub fn is_exact(self) -> bool {
        self.den == 1
    }

    pub fn ticks_to_samples(self, ticks: i64) -> i64 {
        ticks * self.num / self.den
    }

    /// Round-half-up variant used for duration conversion.
    pub fn ticks_to_samples_rounded(self, ticks: i64) -> i64 {
        (ticks * self.num + self.den / 2) / self.den
    }

    pub fn samples_to_ticks(self, samples: i64) -> i64 {
        samples * self.den / self.num
    }
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Start offset of a sibling video stream, in that stream's time base.
/// Purely an input: the engine shifts audio so sample 0 lines up with the
/// first video frame, it never inspects video itself.
#[derive(Clone, Copy, Debug)]
pub struct VideoStart {
    pub start_ticks: i64,
    pub tb_num: i64,
    pub tb_den: i64,
}

/// Immutable facts about the selected audio track, reported at open.
#[derive(Clone, Debug)]
pub struct StreamDescriptor {
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
    /// Nearest cache format to the codec's native sample format.
    pub default_format: SampleFormat,
    pub codec_name: Option<String>,
    /// Raw container time base (seconds per tick = num/den).
    pub tb_num: i64,
    pub tb_den: i64,
    /// Samples per container tick, reduced.
    pub time_base: TimeBase,
    /// Container-declared stream start, in ticks.
    pub declared_start: Option<i64>,
    /// Exact frame count when the container knows it.
    pub n_frames: Option<u64>,
    /// Stream duration in ticks, for containers without a frame count.
    pub duration_ticks: Option<i64>,
    /// Whole-file duration in microseconds, the coarsest fallback.
    pub container_duration_us: Option<i64>,
    /// Seeks land on indexed keyframes; without one, seeks may land on
    /// arbitrary packets and need the any-frame flag.
    pub keyframe_index: bool,
    /// Codec performs its own priming-sample skip (Opus); the engine must
    /// not synthesize leading silence for it.
    pub handles_priming: bool,
    pub video_start: Option<VideoStart>,
}

impl StreamDescriptor {
    /// Total stream length in samples.
    ///
    /// Exact when the container declares frames; otherwise estimated from
    /// the stream or whole-file duration, rounding half up. A stream with
    /// no usable duration at all is treated as ten hours long so the page
    /// index stays finite.
    pub fn resolve_sample_count(&self) -> i64 {
        if let Some(n) = self.n_frames {
            return n as i64;
        }
        if let Some(d) = self.duration_ticks {
            return self.time_base.ticks_to_samples_rounded(d);
        }
        let rate = i64::from(self.sample_rate);
        if let Some(us) = self.container_duration_us {
            return (us * rate + 500_000) / 1_000_000;
        }
        3600 * 10 * rate
    }
}

/// One decoded frame: interleaved `f32` plus where the codec claims it
/// starts. `pts` is in container ticks and may be absent or wrong; the
/// decode driver reconciles it against its own carried position.
#[derive(Clone, Debug)]
pub struct Frame {
    pub pts: Option<i64>,
    pub channels: u32,
    pub rate: u32,
    pub layout: ChannelLayout,
    pub pcm: Vec<f32>,
}

impl Frame {
    /// Frame length in sample positions.
    pub fn len(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.pcm.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Minimal view of a compressed packet: its claimed timestamp.
pub trait PacketTimestamp {
    fn pts(&self) -> Option<i64>;
}

/// Where to land a demuxer seek.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekTarget {
    /// True file start, bypassing timestamp math entirely.
    Start,
    /// Backward seek to at most this tick.
    Ticks(i64),
}

/// Container/codec backend for one audio track.
///
/// `next_packet` yields only the selected track's packets and `None` at
/// end of stream. A `decode_packet` error skips that packet; a
/// `next_packet` error ends the current read (the engine treats both as
/// recoverable, never fatal).
pub trait Demuxer {
    type Packet: PacketTimestamp;

    fn descriptor(&self) -> &StreamDescriptor;

    fn next_packet(&mut self) -> Result<Option<Self::Packet>, DemuxError>;

    fn decode_packet(
        &mut self,
        packet: &Self::Packet,
        out: &mut Vec<Frame>,
    ) -> Result<(), DemuxError>;

    fn seek(&mut self, target: SeekTarget, any_frame: bool) -> Result<(), DemuxError>;

    /// Drop buffered decoder state after a seek.
    fn flush_decoder(&mut self);
}
