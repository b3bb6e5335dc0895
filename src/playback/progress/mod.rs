mod handle;

use crate::playback::service::PlaybackState;
pub use handle::PlaybackProgressHandle;
use std::time::Duration;

/// Updates published by the playback service
#[derive(Debug, Clone)]
pub enum PlaybackProgress {
    StateChanged {
        state: PlaybackState,
    },
    PositionUpdate {
        track_id: String,
        position: Duration,
        duration: Duration,
        /// Fraction of the stream already downloaded
        buffered: f64,
    },
    TrackCompleted {
        track_id: String,
    },
    QueueChanged {
        index: usize,
        len: usize,
    },
    VolumeChanged {
        volume: f64,
    },
}
