pub mod chain;
pub mod convert;
pub mod decode;
pub mod demux;
pub mod error;
pub mod format;
pub mod media;
pub mod page;
pub mod source;
pub mod table;

#[cfg(test)]
mod testing;
