//! Scripted demuxer for exercising the engine without media files.
//!
//! Frames carry their own position as the sample value (`pcm[i] ==
//! position as f32`), so any test can verify that a byte ended up at the
//! right place by reading it back.

use crate::demux::{Demuxer, Frame, PacketTimestamp, SeekTarget, StreamDescriptor, TimeBase};
use crate::error::DemuxError;
use crate::format::{ChannelLayout, SampleFormat};

const RATE: u32 = 48_000;

/// Mono `f32` frame whose samples spell out their own positions.
pub fn frame_at(start: i64, len: usize) -> Frame {
    Frame {
        pts: None,
        channels: 1,
        rate: RATE,
        layout: ChannelLayout::MONO,
        pcm: (0..len).map(|i| (start + i as i64) as f32).collect(),
    }
}

#[derive(Clone, Debug)]
pub struct MockPacket {
    pub pts: Option<i64>,
    pub frames: Vec<Frame>,
    /// Makes `decode_packet` fail for this packet.
    pub poisoned: bool,
}

impl PacketTimestamp for MockPacket {
    fn pts(&self) -> Option<i64> {
        self.pts
    }
}

#[derive(Debug)]
pub struct MockDemuxer {
    pub descriptor: StreamDescriptor,
    pub packets: Vec<MockPacket>,
    pub cursor: usize,
    pub seeks: Vec<(SeekTarget, bool)>,
    pub flushes: usize,
    /// When set, `next_packet` errors once the cursor reaches this index.
    pub fail_at: Option<usize>,
}

impl MockDemuxer {
    pub fn new(rate: u32, total_frames: i64) -> MockDemuxer {
        MockDemuxer {
            descriptor: StreamDescriptor {
                sample_rate: rate,
                channel_layout: ChannelLayout::MONO,
                default_format: SampleFormat::F32,
                codec_name: Some("mock".into()),
                tb_num: 1,
                tb_den: i64::from(rate),
                time_base: TimeBase::from_container(1, i64::from(rate), rate),
                declared_start: Some(0),
                n_frames: Some(total_frames as u64),
                duration_ticks: None,
                container_duration_us: None,
                keyframe_index: true,
                handles_priming: false,
                video_start: None,
            },
            packets: Vec::new(),
            cursor: 0,
            seeks: Vec::new(),
            flushes: 0,
            fail_at: None,
        }
    }

    /// A gapless stream of `packet_len`-sample packets covering
    /// `[0, total_frames)`, each with a truthful timestamp.
    pub fn linear(rate: u32, total_frames: i64, packet_len: usize) -> MockDemuxer {
        let mut m = MockDemuxer::new(rate, total_frames);
        let mut pos = 0i64;
        while pos < total_frames {
            let len = packet_len.min((total_frames - pos) as usize);
            m.push_packet(Some(pos), frame_at(pos, len));
            pos += len as i64;
        }
        m
    }

    pub fn push_packet(&mut self, pts: Option<i64>, frame: Frame) {
        self.packets.push(MockPacket {
            pts,
            frames: vec![frame],
            poisoned: false,
        });
    }
}

impl Demuxer for MockDemuxer {
    type Packet = MockPacket;

    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    fn next_packet(&mut self) -> Result<Option<MockPacket>, DemuxError> {
        if self.fail_at == Some(self.cursor) {
            self.fail_at = None;
            return Err(DemuxError::Io(std::io::Error::other("scripted failure")));
        }
        match self.packets.get(self.cursor) {
            Some(p) => {
                self.cursor += 1;
                Ok(Some(p.clone()))
            }
            None => Ok(None),
        }
    }

    fn decode_packet(
        &mut self,
        packet: &MockPacket,
        out: &mut Vec<Frame>,
    ) -> Result<(), DemuxError> {
        if packet.poisoned {
            return Err(DemuxError::Io(std::io::Error::other("poisoned packet")));
        }
        for (i, frame) in packet.frames.iter().enumerate() {
            let mut frame = frame.clone();
            // the container timestamp belongs to the first frame decoded
            // from the packet
            if i == 0 && frame.pts.is_none() {
                frame.pts = packet.pts;
            }
            out.push(frame);
        }
        Ok(())
    }

    fn seek(&mut self, target: SeekTarget, any_frame: bool) -> Result<(), DemuxError> {
        self.seeks.push((target, any_frame));
        match target {
            SeekTarget::Start => self.cursor = 0,
            SeekTarget::Ticks(t) => {
                // backward semantics: land on the last packet at or before t
                let mut idx = 0;
                for (i, p) in self.packets.iter().enumerate() {
                    if let Some(pts) = p.pts {
                        if pts <= t {
                            idx = i;
                        }
                    }
                }
                self.cursor = idx;
            }
        }
        Ok(())
    }

    fn flush_decoder(&mut self) {
        self.flushes += 1;
    }
}
