use crate::playback::decoder::PcmDecoder;
use std::io::{self, SeekFrom};
use std::sync::Arc;
use thiserror::Error;

/// Output sample rate, fixed for every player
pub const SAMPLE_RATE: u32 = 44_100;
/// Output channel count, fixed for every player
pub const CHANNELS: u16 = 2;
/// Bytes per s16le stereo frame
pub const FRAME_BYTES: u64 = 4;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("No output device available")]
    DeviceNotFound,
    #[error("Output stream configuration failed: {0}")]
    StreamConfigError(String),
    #[error("Output stream build failed: {0}")]
    StreamBuildError(String),
    #[error("Output thread exited before the stream was ready")]
    OutputThreadGone,
}

/// Events a player reports on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    /// The decoder reached its end
    Finished,
    /// Output stopped without being asked to (device loss, decoder failure)
    UnexpectedStop,
}

pub type OutputListener = Arc<dyn Fn(OutputEvent) + Send + Sync>;

/// Creates players on a shared output device
pub trait AudioContext: Send + Sync {
    /// Create a paused player pulling PCM from `decoder`
    fn new_player(
        &self,
        decoder: Box<dyn PcmDecoder>,
        listener: OutputListener,
    ) -> Result<Box<dyn AudioPlayer>, AudioError>;
}

/// One decoder's route to the output device
pub trait AudioPlayer: Send {
    fn play(&mut self);
    fn pause(&mut self);
    fn is_playing(&self) -> bool;
    fn set_volume(&mut self, volume: f64);
    /// Seek the underlying decoder and drop queued audio
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;
    fn close(&mut self);
}
