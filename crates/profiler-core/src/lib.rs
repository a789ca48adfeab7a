//! profiler-core: wire constants, the binary primitive codec, chunks, and
//! collector configuration. All other profiler crates depend on this one.

pub mod chunk;
pub mod codec;
pub mod config;
pub mod wire;

pub use chunk::Chunk;
pub use codec::{BlobReader, BlobWriter, CodecError, FieldReader, FieldWriter};
pub use wire::{Command, Handle, StreamType, WireError};
