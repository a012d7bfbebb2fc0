//! Minimal RIFF/WAVE writer.
//!
//! The `fmt ` chunk payload is the engine's [`WaveFormatExt`] serialized
//! as-is, so a written file doubles as an interop check of the format
//! block hosts negotiate against.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};
use audio_scrub::format::WaveFormatExt;

pub struct WavWriter {
    file: BufWriter<File>,
    fmt: WaveFormatExt,
    data_bytes: u64,
}

impl WavWriter {
    /// Create `path` and write a header with zero-length placeholders;
    /// [`finish`](WavWriter::finish) patches the real sizes in.
    pub fn create(path: &Path, fmt: &WaveFormatExt) -> Result<WavWriter> {
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut w = WavWriter {
            file: BufWriter::new(file),
            fmt: fmt.clone(),
            data_bytes: 0,
        };
        let hdr = header(&w.fmt, 0);
        w.file.write_all(&hdr)?;
        Ok(w)
    }

    pub fn write_samples(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        self.data_bytes += bytes.len() as u64;
        Ok(())
    }

    /// Pad the data chunk to a word boundary, rewrite the header with the
    /// final sizes, and flush.
    pub fn finish(mut self) -> Result<()> {
        let data = u32::try_from(self.data_bytes).context("wav data exceeds 4 GiB")?;
        if data % 2 == 1 {
            self.file.write_all(&[0])?;
        }
        self.file.seek(SeekFrom::Start(0))?;
        let hdr = header(&self.fmt, data);
        self.file.write_all(&hdr)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Everything up to the start of the sample data: RIFF wrapper, `fmt `
/// chunk, and the `data` chunk header.
fn header(fmt: &WaveFormatExt, data_len: u32) -> Vec<u8> {
    let fmt_bytes = fmt.to_bytes();
    let pad = data_len & 1;
    let riff_len = 4 + (8 + fmt_bytes.len() as u32) + (8 + data_len + pad);

    let mut out = Vec::with_capacity(28 + fmt_bytes.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&riff_len.to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&(fmt_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&fmt_bytes);
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out
}
