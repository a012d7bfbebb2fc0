//! The public read surface: a sparse page cache over a decode driver.
//!
//! Reads are served from cached pages when possible and otherwise drive
//! the demuxer synchronously, inline in the call, until the requested
//! position materializes. Missing audio is never a read error: gaps come
//! back as silence and short reads tell the caller to re-request the
//! remainder. Only opening a stream can fail.

use serde::Serialize;

use crate::convert::Resampler;
use crate::decode::{DecodeDriver, ReadInfo, Step};
use crate::demux::Demuxer;
use crate::error::OpenError;
use crate::format::{SampleFormat, TargetFormat, TargetRequest, WaveFormatExt};
use crate::table::PageTable;

/// Cache sizing. The defaults hold up to 32 Mi frames resident, matching
/// the scale the page machinery was built around.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// Frames per page.
    pub page_frames: usize,
    /// Resident-page budget; exceeded by at most one during a swap.
    pub max_resident_pages: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            page_frames: 0x8000,
            max_resident_pages: 1024,
        }
    }
}

/// Outcome of one read call. `frames` counts whole sample positions,
/// `bytes` the same span in output bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadResult {
    pub bytes: usize,
    pub frames: usize,
}

/// Probe summary handed to hosts and the CLI.
#[derive(Clone, Debug, Serialize)]
pub struct StreamInfo {
    pub codec: Option<String>,
    pub sample_rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
    pub bits_per_sample: u16,
    pub sample_count: i64,
    pub duration_seconds: f64,
}

pub struct AudioSource<D: Demuxer, R: Resampler> {
    driver: DecodeDriver<D, R>,
    table: PageTable,
    target: TargetFormat,
    wave: WaveFormatExt,
    config: CacheConfig,
}

impl<D: Demuxer, R: Resampler> AudioSource<D, R> {
    /// Open a stream for cached reads. Fails on layouts the output
    /// descriptor cannot represent and on converter misconfiguration;
    /// everything later is soft.
    pub fn open(demuxer: D, converter: R, config: CacheConfig) -> Result<Self, OpenError> {
        let d = demuxer.descriptor().clone();
        let channels = d.channel_layout.channels();
        if channels > 32 {
            return Err(OpenError::TooManyChannels(channels));
        }
        if channels == 0 {
            return Err(OpenError::UnsupportedChannelLayout);
        }

        let target = TargetFormat::derive(d.channel_layout, d.default_format, d.sample_rate, None);
        let driver = DecodeDriver::new(demuxer, converter, target)?;
        let table = PageTable::new(
            config.page_frames,
            target.frame_size(),
            driver.sample_count(),
            config.max_resident_pages,
        );
        let wave = WaveFormatExt::from_target(&target);

        tracing::debug!(
            channels,
            sample_rate = d.sample_rate,
            sample_count = driver.sample_count(),
            pages = table.page_count(),
            "audio source opened"
        );

        Ok(AudioSource {
            driver,
            table,
            target,
            wave,
            config,
        })
    }

    pub fn sample_count(&self) -> i64 {
        self.driver.sample_count()
    }

    pub fn sample_rate(&self) -> u32 {
        self.driver.sample_rate()
    }

    pub fn target_format(&self) -> TargetFormat {
        self.target
    }

    /// Bytes per output frame under the current format.
    pub fn frame_size(&self) -> usize {
        self.target.frame_size()
    }

    pub fn wave_format(&self) -> &WaveFormatExt {
        &self.wave
    }

    pub fn demuxer(&self) -> &D {
        self.driver.demuxer()
    }

    pub fn stream_info(&self) -> StreamInfo {
        let d = self.driver.descriptor();
        let sample_count = self.driver.sample_count();
        StreamInfo {
            codec: d.codec_name.clone(),
            sample_rate: d.sample_rate,
            channels: self.target.channels(),
            format: self.target.format,
            bits_per_sample: self.target.format.bits_per_sample(),
            sample_count,
            duration_seconds: sample_count as f64 / f64::from(d.sample_rate.max(1)),
        }
    }

    /// Capability probe for a host's null-buffer read: answers "a read
    /// here would produce data" without touching pages or decoder state.
    pub fn probe(&self) -> ReadResult {
        ReadResult { bytes: 0, frames: 1 }
    }

    /// Read up to `count` frames at `start` into `buf`.
    ///
    /// Serves whatever contiguous run the cache can provide, decoding
    /// on demand; the caller re-requests the remainder. Positions the
    /// stream never produced come back as silence. Out-of-range and
    /// zero-length requests report zero frames.
    pub fn read(&mut self, start: i64, count: usize, buf: &mut [u8]) -> ReadResult {
        if start >= self.driver.sample_count() {
            // ends the track; a segment chain forwards before this point
            return ReadResult::default();
        }

        self.driver.ensure_start_time();

        let Some((px, s0)) = self.table.locate(start) else {
            return ReadResult::default();
        };

        let stride = self.target.frame_size();
        let remaining = (self.driver.sample_count() - start) as usize;
        let count = count.min(buf.len() / stride).min(remaining);
        if count == 0 {
            return ReadResult::default();
        }

        // a stream starting late is prefixed with cached silence
        let real_start = self.driver.real_start();
        if real_start > 0 && start < real_start {
            let lead = (real_start - start).min(count as i64) as u64;
            self.insert_silence(start, lead);
            self.driver.note_cached_through(real_start);
        }

        let n = self.table.page(px).copy_out(s0, count, buf, stride);
        if n > 0 {
            return ReadResult {
                bytes: n * stride,
                frames: n,
            };
        }

        self.driver.prepare(start);
        let mut info = ReadInfo::default();
        loop {
            if self.driver.advance(&mut self.table, &mut info) == Step::EndOfStream {
                // inexact sample counts end up here; serve what exists
                // and fill the rest below
                info.last_sample = Some(start);
            }
            if !info.reaches(start) {
                continue;
            }

            if start == 0 {
                if let Some(first) = self.driver.first_decoded() {
                    // some decoders (aac, vorbis) swallow their first
                    // frame; opus repairs the gap itself
                    if first > 0 && !self.driver.handles_priming() {
                        self.insert_silence(0, first as u64);
                    }
                }
            }

            let n = self.table.page(px).copy_out(s0, count, buf, stride);
            if n > 0 {
                return ReadResult {
                    bytes: n * stride,
                    frames: n,
                };
            }

            // seek/decode missed the position; hand back silence for the
            // gap without caching it
            let gap = self
                .table
                .page(px)
                .empty_run(s0, count, self.table.page_frames());
            self.write_silence(&mut buf[..gap * stride]);
            return ReadResult {
                bytes: gap * stride,
                frames: gap,
            };
        }
    }

    /// Choose the output format from the stream plus an optional host
    /// request. A no-op when the effective format does not change;
    /// otherwise the cache resets, since cached bytes are in the old
    /// format.
    pub fn set_target_format(&mut self, request: Option<TargetRequest>) -> Result<(), OpenError> {
        let d = self.driver.descriptor();
        let derived = TargetFormat::derive(d.channel_layout, d.default_format, d.sample_rate, request);
        if derived == self.target {
            return Ok(());
        }
        self.adopt_format(derived)
    }

    /// Apply a format decided elsewhere (the head of a segment chain
    /// governs every member's output format).
    pub(crate) fn adopt_format(&mut self, target: TargetFormat) -> Result<(), OpenError> {
        if target == self.target {
            return Ok(());
        }
        self.driver.set_target(target)?;
        self.target = target;
        self.wave = WaveFormatExt::from_target(&target);
        self.table = PageTable::new(
            self.config.page_frames,
            target.frame_size(),
            self.driver.sample_count(),
            self.config.max_resident_pages,
        );
        self.driver.on_cache_reset();
        tracing::debug!(
            channels = target.channels(),
            format = ?target.format,
            "output format changed, cache reset"
        );
        Ok(())
    }

    /// Drop cached validity for `[start, start+count)`, forcing a
    /// re-decode on the next read there.
    pub fn invalidate(&mut self, start: i64, count: u64) {
        self.table.invalidate(start, count);
    }

    /// Release every page buffer and forget the decode cursor.
    pub fn reset_cache(&mut self) {
        self.table.reset();
        self.driver.on_cache_reset();
    }

    /// Cache silence frames so later reads of the span are plain hits.
    fn insert_silence(&mut self, start: i64, count: u64) {
        let stride = self.target.frame_size();
        let byte = self.target.format.silence_byte();
        let mut start = start;
        let mut remaining = count;
        while remaining > 0 {
            let Some((px, s0)) = self.table.locate(start) else {
                break;
            };
            self.table.ensure_allocated(px);
            let capacity = self.table.page_frames();
            let want = remaining.min(capacity as u64) as usize;
            let page = self.table.page_mut(px);
            let (n, fresh) = page.alloc_range(s0, want, capacity);
            if n == 0 {
                break;
            }
            if fresh {
                if let Some(dst) = page.bytes_mut(s0, n, stride) {
                    dst.fill(byte);
                }
            }
            start += n as i64;
            remaining -= n as u64;
        }
    }

    fn write_silence(&self, buf: &mut [u8]) {
        buf.fill(self.target.format.silence_byte());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::PcmConverter;
    use crate::demux::SeekTarget;
    use crate::testing::{MockDemuxer, frame_at};

    const RATE: u32 = 48_000;

    fn cfg(page_frames: usize, max_resident_pages: usize) -> CacheConfig {
        CacheConfig {
            page_frames,
            max_resident_pages,
        }
    }

    fn source(m: MockDemuxer, c: CacheConfig) -> AudioSource<MockDemuxer, PcmConverter> {
        AudioSource::open(m, PcmConverter::new(), c).unwrap()
    }

    /// Drive `read` until `frames` positions from `start` are filled.
    fn read_exact(
        src: &mut AudioSource<MockDemuxer, PcmConverter>,
        start: i64,
        frames: usize,
    ) -> Vec<u8> {
        let fs = src.frame_size();
        let mut out = vec![0u8; frames * fs];
        let mut done = 0;
        while done < frames {
            let r = src.read(start + done as i64, frames - done, &mut out[done * fs..]);
            assert!(r.frames > 0, "no progress at {}", start + done as i64);
            assert_eq!(r.bytes, r.frames * fs);
            done += r.frames;
        }
        out
    }

    fn f32_at(bytes: &[u8], idx: usize) -> f32 {
        let b = &bytes[idx * 4..idx * 4 + 4];
        f32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    #[test]
    fn out_of_order_reads_reassemble_bit_identical() {
        let mut linear = source(MockDemuxer::linear(RATE, 100_000, 512), cfg(1024, 8));
        let baseline = read_exact(&mut linear, 0, 3000);

        let mut s = source(MockDemuxer::linear(RATE, 100_000, 512), cfg(1024, 8));
        let p1 = read_exact(&mut s, 0, 1000);
        let p2 = read_exact(&mut s, 2000, 1000);
        let packets_before = s.demuxer().cursor;
        let seeks_before = s.demuxer().seeks.len();
        let p3 = read_exact(&mut s, 1000, 1000);
        // the middle piece was already cached by decode read-ahead:
        // no new packets, no new seeks
        assert_eq!(s.demuxer().cursor, packets_before);
        assert_eq!(s.demuxer().seeks.len(), seeks_before);

        let mut reassembled = p1;
        reassembled.extend_from_slice(&p3);
        reassembled.extend_from_slice(&p2);
        assert_eq!(reassembled, baseline);
    }

    #[test]
    fn late_stream_start_serves_silence_then_one_seek() {
        // stream declares its first sample at position 1024
        let mut m = MockDemuxer::new(RATE, 480_000);
        m.descriptor.declared_start = Some(1024);
        let mut pos = 1024i64;
        while pos < 8192 {
            m.push_packet(Some(pos), frame_at(pos, 512));
            pos += 512;
        }
        let mut s = source(m, cfg(4096, 8));

        let mut buf = vec![0u8; 400];
        let r = s.read(0, 100, &mut buf);
        assert_eq!(r, ReadResult { bytes: 400, frames: 100 });
        assert!(buf.iter().all(|&b| b == 0));
        // only the start-probe rewind has touched the demuxer
        assert_eq!(s.demuxer().seeks, vec![(SeekTarget::Start, false)]);

        let r = s.read(1024, 100, &mut buf);
        assert_eq!(r.frames, 100);
        assert_eq!(f32_at(&buf, 0), 1024.0);
        assert_eq!(f32_at(&buf, 99), 1123.0);
        // decoding continued from the start; no further seek, no flush
        assert_eq!(s.demuxer().seeks.len(), 1);
        assert_eq!(s.demuxer().flushes, 0);
    }

    #[test]
    fn u8_output_serves_midpoint_bytes_for_silence() {
        let mut m = MockDemuxer::new(RATE, 10_000);
        m.descriptor.declared_start = Some(512);
        m.descriptor.default_format = SampleFormat::U8;
        m.push_packet(Some(512), frame_at(512, 512));
        let mut s = source(m, cfg(1024, 8));
        assert_eq!(s.target_format().format, SampleFormat::U8);

        let mut buf = vec![0u8; 100];
        let r = s.read(0, 100, &mut buf);
        assert_eq!(r, ReadResult { bytes: 100, frames: 100 });
        assert!(buf.iter().all(|&b| b == 0x80));
    }

    #[test]
    fn priming_gap_at_zero_is_cached_as_silence() {
        let mut m = MockDemuxer::new(RATE, 10_000);
        m.push_packet(Some(1024), frame_at(1024, 1024));
        m.push_packet(Some(2048), frame_at(2048, 1024));
        let mut s = source(m, cfg(4096, 8));

        let mut buf = vec![0u8; 2048 * 4];
        let r = s.read(0, 2048, &mut buf);
        assert_eq!(r.frames, 2048);
        assert_eq!(f32_at(&buf, 0), 0.0);
        assert_eq!(f32_at(&buf, 1023), 0.0);
        assert_eq!(f32_at(&buf, 1024), 1024.0);
        assert_eq!(f32_at(&buf, 2047), 2047.0);
    }

    #[test]
    fn priming_gap_is_not_cached_when_the_codec_handles_it() {
        let mut m = MockDemuxer::new(RATE, 10_000);
        m.descriptor.handles_priming = true;
        m.push_packet(Some(1024), frame_at(1024, 1024));
        m.push_packet(Some(2048), frame_at(2048, 1024));
        let mut s = source(m, cfg(4096, 8));

        let mut buf = vec![0u8; 2048 * 4];
        let r = s.read(0, 2048, &mut buf);
        // silence is synthesized into the caller's buffer only
        assert_eq!(r.frames, 1024);
        assert!(buf[..1024 * 4].iter().all(|&b| b == 0));
        let cached = s.table.page(0).range_a().map(|r| (r.start, r.end));
        assert_eq!(cached, Some((1024, 2048)));
    }

    #[test]
    fn reads_past_the_stream_report_zero() {
        let mut s = source(MockDemuxer::linear(RATE, 10_000, 512), cfg(1024, 8));
        let mut buf = vec![0u8; 64];
        assert_eq!(s.read(10_000, 16, &mut buf), ReadResult::default());
        assert_eq!(s.read(-5, 16, &mut buf), ReadResult::default());
        assert_eq!(s.read(0, 0, &mut buf), ReadResult::default());
        assert_eq!(s.read(0, 16, &mut []), ReadResult::default());
    }

    #[test]
    fn probe_answers_without_touching_anything() {
        let s = source(MockDemuxer::linear(RATE, 10_000, 512), cfg(1024, 8));
        assert_eq!(s.probe(), ReadResult { bytes: 0, frames: 1 });
        assert_eq!(s.demuxer().cursor, 0);
        assert!(s.demuxer().seeks.is_empty());
        assert_eq!(s.table.resident_pages(), 0);
    }

    #[test]
    fn stream_end_inside_the_page_span_fills_silence_and_stays_usable() {
        // declared count far beyond what the packets deliver
        let mut m = MockDemuxer::linear(RATE, 2048, 512);
        m.descriptor.n_frames = Some(10_000);
        let mut s = source(m, cfg(1024, 8));
        assert_eq!(s.sample_count(), 10_000);

        let mut buf = vec![0u8; 400];
        let r = s.read(5000, 100, &mut buf);
        assert_eq!(r.frames, 100);
        assert!(buf.iter().all(|&b| b == 0));

        // a later read of real data still works
        let r = s.read(0, 100, &mut buf);
        assert_eq!(r.frames, 100);
        assert_eq!(f32_at(&buf, 0), 0.0);
        assert_eq!(f32_at(&buf, 99), 99.0);
    }

    #[test]
    fn tiny_budget_alternating_reads_stay_correct() {
        let mut s = source(MockDemuxer::linear(RATE, 200_000, 512), cfg(1024, 1));
        for _ in 0..3 {
            for &start in &[0i64, 150_000, 80_000] {
                let bytes = read_exact(&mut s, start, 100);
                for i in 0..100 {
                    assert_eq!(f32_at(&bytes, i), (start + i as i64) as f32);
                }
                assert!(s.table.resident_pages() <= 2);
            }
        }
    }

    #[test]
    fn format_change_resets_the_cache() {
        let mut s = source(MockDemuxer::linear(RATE, 10_000, 512), cfg(1024, 8));
        read_exact(&mut s, 0, 100);
        assert!(s.table.resident_pages() > 0);

        s.set_target_format(Some(TargetRequest {
            channels: 2,
            bits_per_sample: 16,
        }))
        .unwrap();
        // mono source keeps its layout; 16 bits selects s16
        assert_eq!(s.wave_format().bits_per_sample, 16);
        assert_eq!(s.wave_format().block_align, 2);
        assert_eq!(s.table.resident_pages(), 0);

        let mut buf = vec![0u8; 8];
        let r = s.read(0, 4, &mut buf);
        assert_eq!(r.frames, 4);
        assert_eq!(i16::from_le_bytes([buf[0], buf[1]]), 0);
        // positions clamp at full scale once they exceed 1.0
        assert_eq!(i16::from_le_bytes([buf[2], buf[3]]), 32767);

        // same request again: no reset
        let resident = s.table.resident_pages();
        s.set_target_format(Some(TargetRequest {
            channels: 2,
            bits_per_sample: 16,
        }))
        .unwrap();
        assert_eq!(s.table.resident_pages(), resident);
    }

    #[test]
    fn invalidate_forces_a_fresh_decode() {
        let mut s = source(MockDemuxer::linear(RATE, 10_000, 512), cfg(1024, 8));
        let first = read_exact(&mut s, 0, 100);
        let seeks = s.demuxer().seeks.len();

        s.invalidate(0, 512);
        let again = read_exact(&mut s, 0, 100);
        assert_eq!(again, first);
        assert!(s.demuxer().seeks.len() > seeks);
    }

    #[test]
    fn reset_cache_clears_pages_and_cursor() {
        let mut s = source(MockDemuxer::linear(RATE, 10_000, 512), cfg(1024, 8));
        read_exact(&mut s, 0, 100);
        assert!(s.table.resident_pages() > 0);

        s.reset_cache();
        assert_eq!(s.table.resident_pages(), 0);

        let bytes = read_exact(&mut s, 0, 100);
        assert_eq!(f32_at(&bytes, 42), 42.0);
    }

    #[test]
    fn stream_info_reflects_the_target_format() {
        let s = source(MockDemuxer::linear(RATE, 96_000, 512), cfg(1024, 8));
        let info = s.stream_info();
        assert_eq!(info.sample_rate, RATE);
        assert_eq!(info.sample_count, 96_000);
        assert_eq!(info.channels, 1);
        assert_eq!(info.bits_per_sample, 32);
        assert_eq!(info.duration_seconds, 2.0);
    }
}
