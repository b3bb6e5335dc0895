use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tuneline::catalog::Track;
use tuneline::playback::decoder::RawPcmDecoderFactory;
use tuneline::playback::{
    BufferingConfig, PlaybackDeps, PlaybackHandle, PlaybackProgress, PlaybackService,
    PlaybackSettings, PlaybackState, PlayerStatus,
};
use tuneline::remote::PutStateRequest;
use tuneline::test_support::{
    pattern, test_track, MemoryVolumeStore, MockAudioContext, MockCatalog,
};

use super::tracing_init;

pub const DEVICE_ID: &str = "test-device";

/// Playback service wired to in-memory catalog, output and volume store
pub struct PlaybackFixture {
    pub handle: PlaybackHandle,
    pub progress_rx: mpsc::UnboundedReceiver<PlaybackProgress>,
    pub catalog: Arc<MockCatalog>,
    pub audio: Arc<MockAudioContext>,
    pub volume_store: Arc<MemoryVolumeStore>,
    outbound_rx: Option<mpsc::UnboundedReceiver<PutStateRequest>>,
}

impl PlaybackFixture {
    /// Must be called inside a tokio runtime. With `remote` the service
    /// reconciles snapshots and forwards local changes to `outbound()`.
    pub fn new(remote: bool) -> Self {
        tracing_init();

        let catalog = Arc::new(MockCatalog::new());
        let audio = Arc::new(MockAudioContext::new());
        let volume_store = Arc::new(MemoryVolumeStore::new());

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let transport = remote.then_some(outbound_tx);

        let handle = PlaybackService::start(
            PlaybackDeps {
                catalog: catalog.clone(),
                audio: audio.clone(),
                decoders: Arc::new(RawPcmDecoderFactory),
                volume_store: volume_store.clone(),
            },
            PlaybackSettings {
                device_id: DEVICE_ID.to_string(),
                volume: 0.5,
                volume_step: 0.1,
                buffering: BufferingConfig {
                    chunk_size: 4096,
                    watermark: 64 * 1024,
                    period: Duration::from_millis(10),
                },
            },
            transport,
            tokio::runtime::Handle::current(),
        );
        let progress_rx = handle.subscribe_progress();

        Self {
            handle,
            progress_rx,
            catalog,
            audio,
            volume_store,
            outbound_rx: remote.then_some(outbound_rx),
        }
    }

    /// Register a track whose body is `len` bytes of raw PCM
    pub fn add_track(&self, id: &str, duration_ms: u64, len: usize) -> Track {
        let track = test_track(id, duration_ms);
        self.catalog.add_track(track.clone(), pattern(len));
        track
    }

    pub fn outbound(&mut self) -> &mut mpsc::UnboundedReceiver<PutStateRequest> {
        self.outbound_rx
            .as_mut()
            .expect("fixture was created without remote sync")
    }

    pub fn take_outbound(&mut self) -> mpsc::UnboundedReceiver<PutStateRequest> {
        self.outbound_rx
            .take()
            .expect("fixture was created without remote sync")
    }

    /// Everything forwarded so far
    pub fn drain_outbound(&mut self) -> Vec<PutStateRequest> {
        let mut sent = Vec::new();
        while let Ok(request) = self.outbound().try_recv() {
            sent.push(request);
        }
        sent
    }

    pub async fn status(&self) -> PlayerStatus {
        timeout(Duration::from_secs(5), self.handle.status())
            .await
            .expect("status timed out")
            .expect("playback service stopped")
    }

    /// Poll the service until `predicate` holds
    pub async fn wait_for_status<F>(&self, predicate: F, timeout_duration: Duration) -> Option<PlayerStatus>
    where
        F: Fn(&PlayerStatus) -> bool,
    {
        let deadline = Instant::now() + timeout_duration;
        while Instant::now() < deadline {
            let status = self.status().await;
            if predicate(&status) {
                return Some(status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    /// Wait for a specific state change with timeout
    pub async fn wait_for_state<F>(&mut self, predicate: F, timeout_duration: Duration) -> Option<PlaybackState>
    where
        F: Fn(&PlaybackState) -> bool,
    {
        let deadline = Instant::now() + timeout_duration;
        while Instant::now() < deadline {
            match timeout(Duration::from_millis(100), self.progress_rx.recv()).await {
                Ok(Some(PlaybackProgress::StateChanged { state })) => {
                    if predicate(&state) {
                        return Some(state);
                    }
                }
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        None
    }

    /// Wait for the next TrackCompleted event
    pub async fn wait_for_completion(&mut self, timeout_duration: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout_duration;
        while Instant::now() < deadline {
            match timeout(Duration::from_millis(100), self.progress_rx.recv()).await {
                Ok(Some(PlaybackProgress::TrackCompleted { track_id })) => return Some(track_id),
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        None
    }
}

/// Shorthand for status predicates on the current track
pub fn playing(id: &'static str) -> impl Fn(&PlayerStatus) -> bool {
    move |status| status.track_id.as_deref() == Some(id) && status.state == tuneline::playback::PlayerState::Playing
}
