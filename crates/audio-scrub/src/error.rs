//! Error taxonomy.
//!
//! Only opening a source can fail. Problems that show up later (a packet
//! that will not decode, a seek that lands short, a truncated tail) are
//! absorbed by the read path, which fills silence or returns a partial
//! count instead of erroring. See [`crate::source`].

use std::path::PathBuf;

use thiserror::Error;

/// Failures that make a source unusable.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("container probe failed: {0}")]
    Probe(#[source] symphonia::core::errors::Error),

    #[error("no decodable audio track")]
    NoAudioTrack,

    #[error("codec init failed: {0}")]
    CodecInit(#[source] symphonia::core::errors::Error),

    #[error("unsupported number of channels ({0})")]
    TooManyChannels(u32),

    #[error("unsupported channel layout")]
    UnsupportedChannelLayout,

    #[error("output conversion not supported: {0}")]
    Converter(String),
}

/// Errors surfaced by a demuxer backend.
///
/// The decode driver treats any of these during a read as end of stream
/// for that request; they are never propagated out of `read`.
#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Format(#[from] symphonia::core::errors::Error),
}
