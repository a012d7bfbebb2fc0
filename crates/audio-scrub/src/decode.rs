//! Decode driver: turns "I need sample N" into seeks, packet decodes,
//! and page writes.
//!
//! ## Design
//!
//! The decoder underneath can only move forward from its last seek
//! point, and what it reports about positions is not always true: some
//! containers carry timestamps that disagree with what sequential
//! decoding actually produces. The driver therefore keeps its own
//! carried position (`next_sample`). Frame timestamps are used while
//! they agree with it; on the first disagreement the stream's positions
//! are downgraded permanently and the carried position wins from then
//! on. Because positions are then dead reckoning, a one-sample hole is
//! punched after every decoded frame so cached spans from different
//! decode passes can never silently join across a possibly-misaligned
//! boundary; reads crossing it force a fresh decode instead.
//!
//! Seeks land early on purpose (up to 4096 samples of pre-roll) and the
//! surplus is discarded on decode, which also swallows codec priming
//! output after container-level seeks.

use crate::convert::{InputSpec, Resampler};
use crate::demux::{
    Demuxer, Frame, PacketTimestamp, SeekTarget, StreamDescriptor, TimeBase, VideoStart,
};
use crate::error::OpenError;
use crate::format::TargetFormat;
use crate::table::PageTable;

/// Pre-roll budget for a backward seek, in samples.
const SEEK_PREROLL: i64 = 4096;

/// Where the driver is in its packet-consumption cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrivePhase {
    Idle,
    Seeking,
    Decoding,
    Exhausted,
}

/// Outcome of consuming one packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Decoded,
    EndOfStream,
}

/// Span of sample positions produced while serving one read.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadInfo {
    pub first_sample: Option<i64>,
    pub last_sample: Option<i64>,
}

impl ReadInfo {
    /// True once decoding has produced (or passed) `target`.
    pub fn reaches(&self, target: i64) -> bool {
        self.last_sample.is_some_and(|l| l >= target)
    }
}

pub struct DecodeDriver<D: Demuxer, R: Resampler> {
    demuxer: D,
    converter: R,
    target: TargetFormat,

    // facts resolved from the descriptor at open
    sample_rate: u32,
    sample_count: i64,
    tb_num: i64,
    tb_den: i64,
    time_base: TimeBase,
    use_keyframes: bool,
    handles_priming: bool,
    declared_start: Option<i64>,
    video_start: Option<VideoStart>,

    // lazily resolved alignment (ticks)
    start_time: Option<i64>,
    time_adjust: i64,

    // decode cursor
    next_sample: Option<i64>,
    discard: i64,
    trust_positions: bool,
    first_decoded: Option<i64>,
    phase: DrivePhase,

    frames: Vec<Frame>,
}

impl<D: Demuxer, R: Resampler> DecodeDriver<D, R> {
    pub fn new(demuxer: D, converter: R, target: TargetFormat) -> Result<Self, OpenError> {
        let d = demuxer.descriptor().clone();
        let mut driver = DecodeDriver {
            sample_rate: d.sample_rate,
            sample_count: d.resolve_sample_count(),
            tb_num: d.tb_num,
            tb_den: d.tb_den,
            time_base: d.time_base,
            use_keyframes: d.keyframe_index,
            handles_priming: d.handles_priming,
            declared_start: d.declared_start,
            video_start: d.video_start,
            start_time: None,
            time_adjust: 0,
            next_sample: None,
            discard: 0,
            trust_positions: d.time_base.is_exact(),
            first_decoded: None,
            phase: DrivePhase::Idle,
            frames: Vec::new(),
            demuxer,
            converter,
            target,
        };
        driver.set_target(target)?;
        Ok(driver)
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        self.demuxer.descriptor()
    }

    pub fn demuxer(&self) -> &D {
        &self.demuxer
    }

    pub fn sample_count(&self) -> i64 {
        self.sample_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn handles_priming(&self) -> bool {
        self.handles_priming
    }

    /// Earliest sample position the stream has ever produced.
    pub fn first_decoded(&self) -> Option<i64> {
        self.first_decoded
    }

    pub fn trust_positions(&self) -> bool {
        self.trust_positions
    }

    pub fn phase(&self) -> DrivePhase {
        self.phase
    }

    pub fn next_sample(&self) -> Option<i64> {
        self.next_sample
    }

    /// Reconfigure the output format. The cache must be reset by the
    /// caller; bytes written under the old format are unreadable now.
    pub fn set_target(&mut self, target: TargetFormat) -> Result<(), OpenError> {
        let d = self.demuxer.descriptor();
        let input = InputSpec {
            layout: d.channel_layout,
            rate: d.sample_rate,
        };
        self.converter.configure(input, &target)?;
        self.target = target;
        Ok(())
    }

    /// Forget the decode cursor after the cache was cleared.
    pub fn on_cache_reset(&mut self) {
        self.next_sample = None;
        self.phase = DrivePhase::Idle;
    }

    /// The cache now holds contiguous data through `sample`; continue
    /// decoding from there.
    pub fn note_cached_through(&mut self, sample: i64) {
        self.next_sample = Some(sample);
    }

    /// Resolve the stream's true start on first use.
    ///
    /// Reads ahead one packet: some containers declare start 0 while the
    /// first packet carries a negative presentation time (priming), and
    /// the earlier of the two wins. The demuxer is rewound to the file
    /// start afterwards so the probe never displaces decoding. When a
    /// sibling video track exists its start offset is scaled into the
    /// audio time base so that sample 0 lines up with the first video
    /// frame.
    pub fn ensure_start_time(&mut self) -> i64 {
        if let Some(st) = self.start_time {
            return st;
        }

        let first_pts = match self.demuxer.next_packet() {
            Ok(Some(pkt)) => pkt.pts(),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(error = %e, "start probe hit stream end");
                None
            }
        };
        // nothing went through the decoder, so no flush here
        if let Err(e) = self.demuxer.seek(SeekTarget::Start, !self.use_keyframes) {
            tracing::debug!(error = %e, "could not rewind after start probe");
        }

        let mut start = self.declared_start.unwrap_or(0);
        if let Some(fp) = first_pts {
            if fp < start {
                start = fp;
            }
        }

        let mut adjust = 0i64;
        if let Some(v) = self.video_start {
            if v.tb_den > 0 && self.tb_num > 0 {
                let d = -(v.start_ticks * v.tb_num * self.tb_den) / v.tb_den / self.tb_num;
                start += d;
                adjust += d;
            }
        }

        tracing::debug!(
            start_ticks = start,
            adjust_ticks = adjust,
            "stream start resolved"
        );
        self.start_time = Some(start);
        self.time_adjust = adjust;
        start
    }

    /// First sample position holding real stream data; everything before
    /// it is leading silence. 0 when the stream starts at or before
    /// position zero.
    pub fn real_start(&mut self) -> i64 {
        let st = self.ensure_start_time();
        if st > 0 {
            self.time_base.ticks_to_samples(st)
        } else {
            0
        }
    }

    /// Decide whether reaching `target` needs a seek, and issue it.
    ///
    /// Decoding straight ahead is cheaper than seeking for anything less
    /// than about a second forward; behind the cursor or far ahead, seek
    /// backward with pre-roll and discard the surplus on decode.
    pub fn prepare(&mut self, target: i64) {
        self.ensure_start_time();

        let need_seek = match self.next_sample {
            None => true,
            Some(next) => target > next + i64::from(self.sample_rate) || target < next,
        };
        if !need_seek {
            self.phase = DrivePhase::Decoding;
            return;
        }

        let mut discard = target.min(SEEK_PREROLL);
        let seek_to = if target == 0 {
            discard = 0;
            SeekTarget::Start
        } else {
            SeekTarget::Ticks(self.time_base.samples_to_ticks(target - discard) - self.time_adjust)
        };

        self.demuxer.flush_decoder();
        let any_frame = !self.use_keyframes;
        if let Err(e) = self.demuxer.seek(seek_to, any_frame) {
            tracing::debug!(error = %e, ?seek_to, "seek failed, decoding from current position");
        }

        tracing::debug!(target, discard, ?seek_to, "seeking");
        self.discard = discard;
        self.next_sample = None;
        self.phase = DrivePhase::Seeking;
    }

    /// Consume one packet: decode it and place its frames into the table.
    pub fn advance(&mut self, table: &mut PageTable, info: &mut ReadInfo) -> Step {
        let packet = match self.demuxer.next_packet() {
            Ok(Some(p)) => p,
            Ok(None) => {
                self.phase = DrivePhase::Exhausted;
                return Step::EndOfStream;
            }
            Err(e) => {
                tracing::debug!(error = %e, "demux error treated as end of stream");
                self.phase = DrivePhase::Exhausted;
                return Step::EndOfStream;
            }
        };
        self.phase = DrivePhase::Decoding;

        let mut frames = std::mem::take(&mut self.frames);
        frames.clear();
        if let Err(e) = self.demuxer.decode_packet(&packet, &mut frames) {
            tracing::debug!(error = %e, "skipping undecodable packet");
        }
        for frame in &frames {
            self.place_frame(frame, table, info);
        }
        self.frames = frames;

        Step::Decoded
    }

    /// Place one decoded frame: resolve its position, apply discard and
    /// bounds, convert and write the surviving samples.
    fn place_frame(&mut self, frame: &Frame, table: &mut PageTable, info: &mut ReadInfo) {
        let spec = InputSpec {
            layout: frame.layout,
            rate: frame.rate,
        };
        if let Err(e) = self.converter.configure(spec, &self.target) {
            tracing::warn!(error = %e, "frame format not convertible, dropping frame");
            return;
        }

        let mut count = frame.len() as i64;

        let mut frame_start = self.next_sample;
        if let Some(pts) = frame.pts {
            if Some(pts) == self.start_time {
                self.discard = 0;
            }
            let resolved = self.time_base.ticks_to_samples(pts + self.time_adjust);
            frame_start = match self.next_sample {
                Some(next) if next != resolved => {
                    if self.trust_positions {
                        tracing::warn!(
                            claimed = resolved,
                            carried = next,
                            "timestamps disagree with decode position, downgrading trust"
                        );
                    }
                    self.trust_positions = false;
                    Some(next)
                }
                _ => Some(resolved),
            };
        }
        let Some(fs) = frame_start else {
            tracing::debug!("frame has no timestamp and no carried position, dropping");
            return;
        };

        if self.first_decoded.is_none_or(|f| fs < f) {
            self.first_decoded = Some(fs);
        }

        let mut start = fs;
        let mut src_pos = 0usize;

        // decoder pre-roll and post-seek priming output
        if self.discard > 0 {
            if count > self.discard {
                let n = self.discard;
                self.discard = 0;
                src_pos = n as usize;
                start += n;
                count -= n;
            } else {
                self.discard -= count;
                start += count;
                count = 0;
            }
        }

        // samples before position zero
        if start < 0 {
            let n = -start;
            if n < count {
                src_pos += n as usize;
                start = 0;
                count -= n;
            } else {
                start = 0;
                count = 0;
            }
        }

        // samples beyond the stream end
        if start + count > self.sample_count {
            if start < self.sample_count {
                count = self.sample_count - start;
            } else {
                start = self.sample_count;
                count = 0;
            }
        }

        if count > 0 {
            if info.first_sample.is_none() {
                info.first_sample = Some(start);
            }
            if info.last_sample.is_none_or(|l| l < start + count - 1) {
                info.last_sample = Some(start + count - 1);
            }
        }

        let stride = self.target.frame_size();
        let in_channels = frame.channels as usize;
        while count > 0 {
            let Some((px, s0)) = table.locate(start) else {
                break;
            };
            table.ensure_allocated(px);
            let capacity = table.page_frames();
            let page = table.page_mut(px);
            let (n, fresh) = page.alloc_range(s0, count as usize, capacity);
            if n == 0 {
                break;
            }
            if fresh {
                if let Some(dst) = page.bytes_mut(s0, n, stride) {
                    let src = &frame.pcm[src_pos * in_channels..(src_pos + n) * in_channels];
                    self.converter.convert(src, n, dst);
                }
            }
            src_pos += n;
            start += n as i64;
            count -= n as i64;
        }

        self.next_sample = Some(fs + frame.len() as i64);

        // dead-reckoned positions may be off; a one-sample hole after the
        // frame keeps separately decoded spans from joining
        if !self.trust_positions {
            if let Some(next) = self.next_sample {
                if next > 0 {
                    table.invalidate(next, 1);
                }
            }
        }
    }
}
