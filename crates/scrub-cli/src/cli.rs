use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "scrub", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Frames pulled from the cache per feeder pass
    #[arg(long, default_value_t = 4096)]
    pub chunk_frames: usize,

    /// Queue buffer target in seconds
    #[arg(long, default_value_t = 2.0)]
    pub buffer_seconds: f32,

    /// Cache page size in frames
    #[arg(long, default_value_t = 0x8000)]
    pub page_frames: usize,

    /// Resident-page budget for the cache
    #[arg(long, default_value_t = 1024)]
    pub max_pages: usize,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List output devices
    Devices,

    /// Probe a file and print its stream description
    Info {
        /// Path to audio file
        path: PathBuf,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Decode a sample range through the cache into a WAV file
    Cut {
        /// Path to audio file
        path: PathBuf,

        /// First sample position
        #[arg(long, default_value_t = 0)]
        start: i64,

        /// Sample count; the rest of the stream when omitted
        #[arg(long)]
        frames: Option<u64>,

        /// Output WAV path
        #[arg(short, long)]
        output: PathBuf,

        /// Channel count override (1 or 2)
        #[arg(long)]
        channels: Option<u16>,

        /// Bit depth override (8 or 16)
        #[arg(long)]
        bits: Option<u16>,
    },

    /// Play a sample range through the cache
    Play {
        /// Path to audio file
        path: PathBuf,

        /// First sample position
        #[arg(long, default_value_t = 0)]
        start: i64,

        /// Sample count; the rest of the stream when omitted
        #[arg(long)]
        frames: Option<u64>,

        /// Repeat the range until interrupted
        #[arg(long = "loop")]
        loop_playback: bool,
    },
}
