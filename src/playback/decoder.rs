use crate::playback::streaming::BufferedStream;
use std::io::{Read, Seek};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("Symphonia error: {0}")]
    Symphonia(#[from] symphonia::core::errors::Error),
    #[error("No audio tracks found")]
    NoAudioTracks,
    #[error("Track duration is unknown")]
    UnknownDuration,
}

/// PCM source handed to an output player: signed 16-bit little-endian,
/// interleaved stereo. Seek offsets address the encoded stream's byte space.
pub trait PcmDecoder: Read + Seek + Send {}

impl<T: Read + Seek + Send> PcmDecoder for T {}

/// Binds a fresh decoder to a buffered stream
pub trait DecoderFactory: Send + Sync {
    fn open(&self, stream: BufferedStream) -> Result<Box<dyn PcmDecoder>, DecoderError>;
}

/// Pass-through for streams that already carry s16le stereo frames.
/// Byte offsets are the same in both spaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawPcmDecoderFactory;

impl DecoderFactory for RawPcmDecoderFactory {
    fn open(&self, stream: BufferedStream) -> Result<Box<dyn PcmDecoder>, DecoderError> {
        Ok(Box::new(stream))
    }
}
