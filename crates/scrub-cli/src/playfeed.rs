//! Cache-fed playback.
//!
//! A feeder thread pulls the requested range out of the page cache into
//! a bounded queue, rubato adapts the rate when the device disagrees
//! with the source, and the CPAL callback drains the queue without ever
//! blocking. With `--loop` every pass after the first is served from
//! cache hits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use audio_scrub::convert::PcmConverter;
use audio_scrub::format::SampleFormat;
use audio_scrub::media::MediaDemuxer;
use audio_scrub::source::AudioSource;
use audioadapter_buffers::direct::InterleavedSlice;
use cpal::traits::{DeviceTrait, StreamTrait};
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

/// Frames the callback pulls from the queue per refill.
const REFILL_MAX_FRAMES: usize = 4096;

#[derive(Clone, Copy, Debug)]
pub struct PlayParams {
    pub start: i64,
    pub frames: u64,
    pub repeat: bool,
    pub chunk_frames: usize,
    pub buffer_seconds: f32,
}

/// Play `params.frames` positions starting at `params.start` and block
/// until the range drained or the user interrupted.
pub fn play_range(
    device: &cpal::Device,
    config: &cpal::SupportedStreamConfig,
    stream_config: &cpal::StreamConfig,
    source: AudioSource<MediaDemuxer, PcmConverter>,
    params: PlayParams,
) -> Result<()> {
    let channels = source.target_format().channels() as usize;
    let dst_rate = stream_config.sample_rate;

    let capacity = queue_capacity(dst_rate, channels, params.buffer_seconds);
    let queue = Arc::new(SampleQueue::new(channels, capacity));

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, stream_config, &queue),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, stream_config, &queue),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, stream_config, &queue),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, stream_config, &queue),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }?;
    stream.play()?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        // first interrupt drains gracefully, the second one gives up
        let stop = stop.clone();
        let queue = queue.clone();
        let _ = ctrlc::set_handler(move || {
            if stop.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
            queue.close();
        });
    }

    let feeder = {
        let queue = queue.clone();
        let stop = stop.clone();
        thread::spawn(move || feed_loop(source, &queue, &stop, dst_rate, params))
    };

    queue.wait_done_and_empty();
    thread::sleep(Duration::from_millis(100));
    let _ = feeder.join();
    Ok(())
}

/// Read the range chunk by chunk and keep the queue topped up.
fn feed_loop(
    mut source: AudioSource<MediaDemuxer, PcmConverter>,
    queue: &Arc<SampleQueue>,
    stop: &AtomicBool,
    dst_rate: u32,
    params: PlayParams,
) {
    let chunk = params.chunk_frames.max(1);
    let fs = source.frame_size();
    let format = source.target_format().format;
    let channels = source.target_format().channels() as usize;
    let src_rate = source.sample_rate();

    let mut resampler = if src_rate == dst_rate {
        None
    } else {
        match FeedResampler::new(src_rate, dst_rate, chunk, channels) {
            Ok(r) => {
                tracing::info!(from_hz = src_rate, to_hz = dst_rate, "resampling");
                Some(r)
            }
            Err(e) => {
                tracing::error!("resampler init error: {e:#}");
                queue.close();
                return;
            }
        }
    };

    let mut bytes = vec![0u8; chunk * fs];
    let mut samples: Vec<f32> = Vec::with_capacity(chunk * channels);

    let end = params.start + params.frames as i64;
    let mut pos = params.start;

    while !stop.load(Ordering::Relaxed) {
        if pos >= end {
            if params.repeat {
                pos = params.start;
                continue;
            }
            break;
        }

        let want = ((end - pos) as usize).min(chunk);
        let r = source.read(pos, want, &mut bytes);
        if r.frames == 0 {
            // the length was an estimate and the stream ended short of it
            break;
        }
        pos += r.frames as i64;

        to_f32(&bytes[..r.bytes], format, &mut samples);
        let pushed = match &mut resampler {
            Some(rs) => rs.push(&samples, queue),
            None => {
                queue.push_blocking(&samples);
                Ok(())
            }
        };
        if let Err(e) = pushed {
            tracing::error!("resample error: {e:#}");
            break;
        }
    }

    if let Some(rs) = &mut resampler {
        if let Err(e) = rs.flush(queue) {
            tracing::debug!("resample flush error: {e:#}");
        }
    }
    queue.close();
}

/// Streaming sinc resampler over fixed input chunks, with a zero-padded
/// partial chunk to flush the tail.
struct FeedResampler {
    inner: Async<f32>,
    channels: usize,
    chunk_frames: usize,
    pending: Vec<f32>,
    out: Vec<f32>,
}

impl FeedResampler {
    fn new(src_rate: u32, dst_rate: u32, chunk_frames: usize, channels: usize) -> Result<Self> {
        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };
        let inner = Async::<f32>::new_sinc(
            f64::from(dst_rate) / f64::from(src_rate),
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| anyhow!("create resampler: {e}"))?;
        let out = vec![0.0f32; inner.output_frames_max() * channels];

        Ok(FeedResampler {
            inner,
            channels,
            chunk_frames,
            pending: Vec::new(),
            out,
        })
    }

    fn push(&mut self, samples: &[f32], queue: &SampleQueue) -> Result<()> {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.chunk_frames * self.channels {
            self.process_chunk(queue, None)?;
        }
        Ok(())
    }

    fn flush(&mut self, queue: &SampleQueue) -> Result<()> {
        let frames = self.pending.len() / self.channels;
        if frames == 0 {
            return Ok(());
        }
        self.pending.resize(self.chunk_frames * self.channels, 0.0);
        self.process_chunk(queue, Some(frames))
    }

    fn process_chunk(&mut self, queue: &SampleQueue, partial: Option<usize>) -> Result<()> {
        let chunk_samples = self.chunk_frames * self.channels;
        let input =
            InterleavedSlice::new(&self.pending[..chunk_samples], self.channels, self.chunk_frames)
                .map_err(|e| anyhow!("interleaved input: {e}"))?;
        let out_frames = self.out.len() / self.channels;
        let mut output = InterleavedSlice::new_mut(&mut self.out, self.channels, out_frames)
            .map_err(|e| anyhow!("interleaved output: {e}"))?;

        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: partial,
        };
        let (_consumed, produced) = self
            .inner
            .process_into_buffer(&input, &mut output, Some(&indexing))
            .map_err(|e| anyhow!("resample: {e}"))?;

        queue.push_blocking(&self.out[..produced * self.channels]);
        self.pending.drain(..chunk_samples);
        Ok(())
    }
}

/// Type-specialized CPAL stream: refill a local buffer from the queue
/// without blocking, map channels, convert to the device sample format.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SampleQueue>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = (config.channels as usize).max(1);
    let src_channels = queue.channels();
    let q = queue.clone();

    let mut local: Vec<f32> = Vec::new();
    let mut pos = 0usize;

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let frames = data.len() / channels_out;
            for frame in 0..frames {
                if pos >= local.len() {
                    pos = 0;
                    local.clear();
                    match q.pop_frames(REFILL_MAX_FRAMES) {
                        Some(v) => local = v,
                        None => {
                            // nothing buffered; the rest of this period is silence
                            for idx in (frame * channels_out)..data.len() {
                                data[idx] = <T as cpal::Sample>::from_sample::<f32>(0.0);
                            }
                            return;
                        }
                    }
                }
                for ch in 0..channels_out {
                    let s = map_channel(&local[pos..], src_channels, channels_out, ch);
                    data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(s);
                }
                pos += src_channels;
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// One output sample for `dst_ch`: mono duplicates, stereo-to-mono
/// averages, anything wider clamps to the available channels.
fn map_channel(src_frame: &[f32], src_channels: usize, dst_channels: usize, dst_ch: usize) -> f32 {
    let get = |ch: usize| src_frame.get(ch).copied().unwrap_or(0.0);
    match (src_channels, dst_channels) {
        (1, _) => get(0),
        (2, 1) => 0.5 * (get(0) + get(1)),
        (2, 2) => get(dst_ch.min(1)),
        _ => get(dst_ch.min(src_channels.saturating_sub(1))),
    }
}

/// Decode cache bytes back into `f32` for the playback stages.
fn to_f32(bytes: &[u8], format: SampleFormat, out: &mut Vec<f32>) {
    out.clear();
    match format {
        SampleFormat::F32 => {
            for b in bytes.chunks_exact(4) {
                out.push(f32::from_le_bytes([b[0], b[1], b[2], b[3]]));
            }
        }
        SampleFormat::S16 => {
            for b in bytes.chunks_exact(2) {
                out.push(f32::from(i16::from_le_bytes([b[0], b[1]])) / 32_768.0);
            }
        }
        SampleFormat::U8 => {
            for &b in bytes {
                out.push((f32::from(b) - 128.0) / 128.0);
            }
        }
    }
}

/// Queue capacity in samples for a `(rate, channels, seconds)` target.
fn queue_capacity(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };
    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

/// Bounded queue of interleaved samples between the feeder thread and
/// the playback callback. The producer blocks on a full queue; the
/// callback never blocks.
pub struct SampleQueue {
    channels: usize,
    max_samples: usize,
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

struct QueueInner {
    samples: VecDeque<f32>,
    done: bool,
}

impl SampleQueue {
    pub fn new(channels: usize, max_samples: usize) -> SampleQueue {
        SampleQueue {
            channels: channels.max(1),
            max_samples: max_samples.max(1),
            inner: Mutex::new(QueueInner {
                samples: VecDeque::new(),
                done: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Push interleaved samples, blocking while the queue is full. Data
    /// is dropped once the queue is closed.
    pub fn push_blocking(&self, samples: &[f32]) {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.inner.lock().unwrap();
            while g.samples.len() >= self.max_samples && !g.done {
                g = self.cv.wait(g).unwrap();
            }
            if g.done {
                return;
            }
            while offset < samples.len() && g.samples.len() < self.max_samples {
                g.samples.push_back(samples[offset]);
                offset += 1;
            }
            drop(g);
            self.cv.notify_all();
        }
    }

    /// Pop up to `max_frames` whole frames without blocking. `None` when
    /// nothing is buffered right now.
    pub fn pop_frames(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.inner.lock().unwrap();
        let available = g.samples.len() / self.channels;
        let take = available.min(max_frames) * self.channels;
        if take == 0 {
            return None;
        }
        let out: Vec<f32> = g.samples.drain(..take).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Mark the stream finished and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.done = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Block until the feeder closed the queue and playback drained it.
    pub fn wait_done_and_empty(&self) {
        let mut g = self.inner.lock().unwrap();
        while !(g.done && g.samples.is_empty()) {
            g = self.cv.wait(g).unwrap();
        }
    }
}
