pub mod controller;
mod cpal_output;
pub mod decoder;
pub mod output;
pub mod progress;
pub mod queue;
pub mod service;
pub mod streaming;
mod symphonia_decoder;

pub use controller::{PlaybackController, PlayerState, Provenance};
pub use cpal_output::CpalAudioContext;
pub use progress::{PlaybackProgress, PlaybackProgressHandle};
pub use queue::{Queue, QueueKind};
pub use service::{
    PlaybackCommand, PlaybackDeps, PlaybackHandle, PlaybackService, PlaybackSettings,
    PlaybackState, PlayerStatus,
};
pub use streaming::{BufferedStream, BufferingConfig, LiveSource};
pub use symphonia_decoder::{SymphoniaDecoder, SymphoniaDecoderFactory};
