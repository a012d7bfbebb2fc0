mod cli;
mod device;
mod playfeed;
mod wav;

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use cpal::traits::DeviceTrait;
use tracing_subscriber::EnvFilter;

use audio_scrub::convert::PcmConverter;
use audio_scrub::format::TargetRequest;
use audio_scrub::media::MediaDemuxer;
use audio_scrub::source::{AudioSource, CacheConfig};

use crate::cli::{Args, Command};
use crate::playfeed::PlayParams;

type Source = AudioSource<MediaDemuxer, PcmConverter>;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,audio_scrub=info")),
        )
        .init();

    let args = Args::parse();

    match &args.cmd {
        Command::Devices => device::list_devices(&cpal::default_host()),
        Command::Info { path, json } => cmd_info(&args, path, *json),
        Command::Cut {
            path,
            start,
            frames,
            output,
            channels,
            bits,
        } => cmd_cut(&args, path, *start, *frames, output, *channels, *bits),
        Command::Play {
            path,
            start,
            frames,
            loop_playback,
        } => cmd_play(&args, path, *start, *frames, *loop_playback),
    }
}

fn open_source(args: &Args, path: &Path) -> Result<Source> {
    let demuxer = MediaDemuxer::open(path)?;
    let source = AudioSource::open(
        demuxer,
        PcmConverter::new(),
        CacheConfig {
            page_frames: args.page_frames,
            max_resident_pages: args.max_pages,
        },
    )?;
    Ok(source)
}

fn cmd_info(args: &Args, path: &Path, json: bool) -> Result<()> {
    let source = open_source(args, path)?;
    let info = source.stream_info();

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("codec:        {}", info.codec.as_deref().unwrap_or("unknown"));
    println!("sample rate:  {} Hz", info.sample_rate);
    println!("channels:     {}", info.channels);
    println!("bits:         {}", info.bits_per_sample);
    println!("samples:      {}", info.sample_count);
    println!("duration:     {:.3} s", info.duration_seconds);
    Ok(())
}

fn cmd_cut(
    args: &Args,
    path: &Path,
    start: i64,
    frames: Option<u64>,
    output: &Path,
    channels: Option<u16>,
    bits: Option<u16>,
) -> Result<()> {
    let mut source = open_source(args, path)?;
    if channels.is_some() || bits.is_some() {
        source.set_target_format(Some(TargetRequest {
            channels: channels.unwrap_or(0),
            bits_per_sample: bits.unwrap_or(0),
        }))?;
    }

    let total = source.sample_count();
    let start = start.clamp(0, total);
    let remaining = (total - start) as u64;
    let want = frames.unwrap_or(remaining).min(remaining);

    let mut writer = wav::WavWriter::create(output, source.wave_format())?;

    let chunk = args.chunk_frames.max(1);
    let mut buf = vec![0u8; chunk * source.frame_size()];
    let end = start + want as i64;
    let mut pos = start;
    while pos < end {
        let count = ((end - pos) as usize).min(chunk);
        let r = source.read(pos, count, &mut buf);
        if r.frames == 0 {
            // the declared length overshot the stream
            break;
        }
        writer.write_samples(&buf[..r.bytes])?;
        pos += r.frames as i64;
    }
    writer.finish()?;

    tracing::info!(
        frames = pos - start,
        path = %output.display(),
        "wrote wav"
    );
    Ok(())
}

fn cmd_play(args: &Args, path: &Path, start: i64, frames: Option<u64>, repeat: bool) -> Result<()> {
    let mut source = open_source(args, path)?;
    if source.target_format().channels() > 2 {
        // playback mapping tops out at stereo
        source.set_target_format(Some(TargetRequest {
            channels: 2,
            bits_per_sample: 0,
        }))?;
    }

    let total = source.sample_count();
    let start = start.clamp(0, total);
    let remaining = (total - start) as u64;
    let want = frames.unwrap_or(remaining).min(remaining);
    if want == 0 {
        tracing::info!("nothing to play");
        return Ok(());
    }

    let host = cpal::default_host();
    let device = device::pick_device(&host, args.device.as_deref())?;
    let config = device::pick_output_config(&device, Some(source.sample_rate()))?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(size) = device::pick_buffer_size(&config) {
        stream_config.buffer_size = size;
    }

    tracing::info!("output device: {}", device.description()?);
    tracing::info!(
        rate = stream_config.sample_rate,
        channels = stream_config.channels,
        "output config"
    );

    playfeed::play_range(
        &device,
        &config,
        &stream_config,
        source,
        PlayParams {
            start,
            frames: want,
            repeat,
            chunk_frames: args.chunk_frames,
            buffer_seconds: args.buffer_seconds,
        },
    )
}
