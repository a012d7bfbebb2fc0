//! File-backed demuxing and decoding through Symphonia.
//!
//! The production [`Demuxer`]: probes the container once at open, picks
//! the first decodable audio track, and translates the engine's seek
//! requests into coarse (at-or-before) container seeks. Symphonia keeps
//! audio timestamps in sample-frame units for every format we enable,
//! so packet timestamps map onto the stream time base directly.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::{Layout, SampleBuffer};
use symphonia::core::codecs::{
    CODEC_TYPE_NULL, CODEC_TYPE_OPUS, CodecParameters, CodecType, Decoder, DecoderOptions,
};
use symphonia::core::formats::{FormatOptions, FormatReader, Packet, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::demux::{Demuxer, Frame, PacketTimestamp, SeekTarget, StreamDescriptor, TimeBase};
use crate::error::{DemuxError, OpenError};
use crate::format::{ChannelLayout, SampleFormat};

pub struct MediaDemuxer {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    descriptor: StreamDescriptor,
}

impl MediaDemuxer {
    /// Probe `path` and open its first decodable audio track.
    pub fn open(path: &Path) -> Result<MediaDemuxer, OpenError> {
        let file = File::open(path).map_err(|e| OpenError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        Self::from_media_source(Box::new(file), hint)
    }

    /// Open the first decodable audio track of any [`MediaSource`], for
    /// hosts that hand over something other than a file path.
    pub fn from_media_source(
        source: Box<dyn MediaSource>,
        hint: Hint,
    ) -> Result<MediaDemuxer, OpenError> {
        let mss = MediaSourceStream::new(source, Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(OpenError::Probe)?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| {
                t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some()
            })
            .ok_or(OpenError::NoAudioTrack)?;
        let track_id = track.id;
        let params = track.codec_params.clone();
        let descriptor = describe(&params)?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(OpenError::CodecInit)?;

        tracing::debug!(
            codec = ?descriptor.codec_name,
            sample_rate = descriptor.sample_rate,
            channels = descriptor.channel_layout.channels(),
            "opened audio track"
        );

        Ok(MediaDemuxer {
            format,
            decoder,
            track_id,
            descriptor,
        })
    }
}

impl Demuxer for MediaDemuxer {
    type Packet = Packet;

    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    fn next_packet(&mut self) -> Result<Option<Packet>, DemuxError> {
        use symphonia::core::errors::Error;
        loop {
            match self.format.next_packet() {
                Ok(p) => {
                    if p.track_id() == self.track_id {
                        return Ok(Some(p));
                    }
                }
                Err(Error::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(Error::ResetRequired) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn decode_packet(&mut self, packet: &Packet, out: &mut Vec<Frame>) -> Result<(), DemuxError> {
        let decoded = self.decoder.decode(packet)?;
        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            return Ok(());
        }

        let mut buf = SampleBuffer::<f32>::new(frames as u64, spec);
        buf.copy_interleaved_ref(decoded);

        out.push(Frame {
            pts: Some(packet.ts() as i64),
            channels: spec.channels.count() as u32,
            rate: spec.rate,
            layout: ChannelLayout(u64::from(spec.channels.bits())),
            pcm: buf.samples().to_vec(),
        });
        Ok(())
    }

    fn seek(&mut self, target: SeekTarget, _any_frame: bool) -> Result<(), DemuxError> {
        let to = match target {
            SeekTarget::Start => SeekTo::Time {
                time: Time::new(0, 0.0),
                track_id: Some(self.track_id),
            },
            SeekTarget::Ticks(t) => SeekTo::TimeStamp {
                ts: t.max(0) as u64,
                track_id: self.track_id,
            },
        };
        // coarse mode lands at or before the target, which is what the
        // engine's pre-roll accounting assumes
        self.format.seek(SeekMode::Coarse, to)?;
        Ok(())
    }

    fn flush_decoder(&mut self) {
        self.decoder.reset();
    }
}

impl PacketTimestamp for Packet {
    fn pts(&self) -> Option<i64> {
        Some(self.ts() as i64)
    }
}

/// Build the engine-facing stream description from codec parameters.
fn describe(params: &CodecParameters) -> Result<StreamDescriptor, OpenError> {
    let rate = params.sample_rate.ok_or(OpenError::NoAudioTrack)?;
    let channel_layout = track_layout(params)?;

    let (tb_num, tb_den) = match params.time_base {
        Some(tb) => (i64::from(tb.numer), i64::from(tb.denom)),
        None => (1, i64::from(rate)),
    };

    Ok(StreamDescriptor {
        sample_rate: rate,
        channel_layout,
        default_format: native_format(params.codec),
        codec_name: codec_label(params.codec),
        tb_num,
        tb_den,
        time_base: TimeBase::from_container(tb_num, tb_den, rate),
        declared_start: Some(params.start_ts as i64),
        n_frames: params.n_frames,
        duration_ticks: None,
        container_duration_us: None,
        keyframe_index: true,
        handles_priming: params.codec == CODEC_TYPE_OPUS,
        video_start: None,
    })
}

fn track_layout(params: &CodecParameters) -> Result<ChannelLayout, OpenError> {
    if let Some(ch) = params.channels {
        return Ok(ChannelLayout(u64::from(ch.bits())));
    }
    match params.channel_layout {
        Some(Layout::Mono) => Ok(ChannelLayout::MONO),
        Some(Layout::Stereo) => Ok(ChannelLayout::STEREO),
        Some(Layout::TwoPointOne) => Ok(ChannelLayout::default_for_count(3)),
        Some(Layout::FivePointOne) => Ok(ChannelLayout::default_for_count(6)),
        None => Err(OpenError::UnsupportedChannelLayout),
    }
}

/// Closest uncompressed representation of what the codec stores; used to
/// pick the default output format.
fn native_format(codec: CodecType) -> SampleFormat {
    use symphonia::core::codecs::*;
    match codec {
        CODEC_TYPE_PCM_U8 => SampleFormat::U8,
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => SampleFormat::S16,
        _ => SampleFormat::F32,
    }
}

/// Best-effort codec label used for status payloads.
fn codec_label(codec: CodecType) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_U8 => "PCM_U8",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}
