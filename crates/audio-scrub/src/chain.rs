//! Segment chaining: several opened sources served as one timeline.
//!
//! Hosts splice clips back to back. The chain routes each read to the
//! segment that owns the requested span and keeps every member
//! rendering in the head segment's output format, so bytes from any
//! segment are interchangeable.

use crate::convert::Resampler;
use crate::demux::Demuxer;
use crate::error::OpenError;
use crate::format::{TargetRequest, WaveFormatExt};
use crate::source::{AudioSource, ReadResult, StreamInfo};

/// A non-empty run of sources played back to back. The first segment is
/// the head; its output format governs the whole chain.
pub struct SegmentChain<D: Demuxer, R: Resampler> {
    segments: Vec<AudioSource<D, R>>,
}

impl<D: Demuxer, R: Resampler> SegmentChain<D, R> {
    pub fn new(head: AudioSource<D, R>) -> SegmentChain<D, R> {
        SegmentChain {
            segments: vec![head],
        }
    }

    /// Append a segment. It adopts the head's output format on the way
    /// in, resetting its cache if it was rendering differently.
    pub fn push(&mut self, mut segment: AudioSource<D, R>) -> Result<(), OpenError> {
        segment.adopt_format(self.segments[0].target_format())?;
        self.segments.push(segment);
        Ok(())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: usize) -> Option<&AudioSource<D, R>> {
        self.segments.get(index)
    }

    /// Combined length in frames.
    pub fn total_sample_count(&self) -> i64 {
        self.segments.iter().map(|s| s.sample_count()).sum()
    }

    pub fn sample_rate(&self) -> u32 {
        self.segments[0].sample_rate()
    }

    pub fn wave_format(&self) -> &WaveFormatExt {
        self.segments[0].wave_format()
    }

    /// The head's stream description with the combined length.
    pub fn stream_info(&self) -> StreamInfo {
        let mut info = self.segments[0].stream_info();
        info.sample_count = self.total_sample_count();
        info.duration_seconds =
            info.sample_count as f64 / f64::from(self.segments[0].sample_rate().max(1));
        info
    }

    pub fn probe(&self) -> ReadResult {
        self.segments[0].probe()
    }

    /// Read across the chain. Positions are chain-relative; the request
    /// lands on the segment owning `start`. Requests past the final
    /// segment come back as that segment's zero read.
    pub fn read(&mut self, start: i64, count: usize, buf: &mut [u8]) -> ReadResult {
        let mut start = start;
        let last = self.segments.len() - 1;
        for (i, seg) in self.segments.iter_mut().enumerate() {
            if start < seg.sample_count() || i == last {
                return seg.read(start, count, buf);
            }
            start -= seg.sample_count();
        }
        ReadResult::default()
    }

    /// Re-derive the head's output format from `request` and push the
    /// result to every member.
    pub fn set_target_format(&mut self, request: Option<TargetRequest>) -> Result<(), OpenError> {
        let Some((head, rest)) = self.segments.split_first_mut() else {
            return Ok(());
        };
        head.set_target_format(request)?;
        let target = head.target_format();
        for seg in rest {
            seg.adopt_format(target)?;
        }
        Ok(())
    }

    /// Invalidate a chain-relative span, splitting it over the segments
    /// it touches.
    pub fn invalidate(&mut self, start: i64, count: u64) {
        let mut start = start;
        let mut count = count;
        for seg in &mut self.segments {
            if count == 0 {
                break;
            }
            let len = seg.sample_count();
            if start < len {
                let span = (len - start.max(0)) as u64;
                seg.invalidate(start, count.min(span));
                count = count.saturating_sub(span);
                start = 0;
            } else {
                start -= len;
            }
        }
    }

    pub fn reset_cache(&mut self) {
        for seg in &mut self.segments {
            seg.reset_cache();
        }
    }
}
