// Test support utilities for both unit and integration tests

use crate::catalog::{
    Artist, Catalog, CatalogError, DownloadInfo, LiveDownload, StationBatch, StationFeedback,
    Track,
};
use crate::config::{ConfigError, VolumeStore};
use crate::playback::decoder::{DecoderError, DecoderFactory, PcmDecoder};
use crate::playback::output::{AudioContext, AudioError, AudioPlayer, OutputEvent, OutputListener};
use crate::playback::streaming::{BufferedStream, LiveSource};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Track descriptor with a fixed duration and one artist
pub fn test_track(id: &str, duration_ms: u64) -> Track {
    Track {
        id: id.to_string(),
        title: format!("Track {}", id),
        version: None,
        available: true,
        duration_ms,
        artists: vec![Artist {
            id: 1,
            name: "Test Artist".to_string(),
        }],
        albums: Vec::new(),
    }
}

/// Deterministic test payload: byte i is `i % 251`
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// In-memory live source with optional short reads and a failure point
pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
    max_read: Option<usize>,
    fail_at: Option<usize>,
    closed: bool,
    releases: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            max_read: None,
            fail_at: None,
            closed: false,
            releases: Arc::new(AtomicUsize::new(0)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Never return more than `n` bytes per read
    pub fn with_max_read(mut self, n: usize) -> Self {
        self.max_read = Some(n.max(1));
        self
    }

    /// Fail every read once `offset` bytes have been delivered
    pub fn failing_at(mut self, offset: usize) -> Self {
        self.fail_at = Some(offset);
        self
    }

    /// Counts calls to `close`
    pub fn release_counter(&self) -> Arc<AtomicUsize> {
        self.releases.clone()
    }

    /// Counts calls to `read`
    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        self.reads.clone()
    }
}

impl LiveSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.closed {
            return Err(io::Error::other("source already closed"));
        }
        if self.fail_at.is_some_and(|at| self.pos >= at) {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
        }

        let mut n = buf.len().min(self.data.len() - self.pos);
        if let Some(max) = self.max_read {
            n = n.min(max);
        }
        if let Some(at) = self.fail_at {
            n = n.min(at - self.pos);
        }
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Decoder factory that accepts nothing
pub struct RejectingDecoderFactory;

impl DecoderFactory for RejectingDecoderFactory {
    fn open(&self, _stream: BufferedStream) -> Result<Box<dyn PcmDecoder>, DecoderError> {
        Err(DecoderError::NoAudioTracks)
    }
}

/// What a mock player has been told, plus a way to fire its events
pub struct MockPlayerState {
    decoder: Mutex<Box<dyn PcmDecoder>>,
    listener: OutputListener,
    playing: AtomicBool,
    closed: AtomicBool,
    volume: Mutex<f64>,
    seeks: Mutex<Vec<u64>>,
}

impl MockPlayerState {
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn volume(&self) -> f64 {
        *self.volume.lock()
    }

    /// Byte positions the decoder was moved to, in order
    pub fn seeks(&self) -> Vec<u64> {
        self.seeks.lock().clone()
    }

    /// Report an event as the output thread would
    pub fn emit(&self, event: OutputEvent) {
        (self.listener)(event);
    }
}

struct MockPlayer {
    state: Arc<MockPlayerState>,
}

impl AudioPlayer for MockPlayer {
    fn play(&mut self) {
        self.state.playing.store(true, Ordering::SeqCst);
    }

    fn pause(&mut self) {
        self.state.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.state.is_playing()
    }

    fn set_volume(&mut self, volume: f64) {
        *self.state.volume.lock() = volume;
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = self.state.decoder.lock().seek(pos)?;
        self.state.seeks.lock().push(new_pos);
        Ok(new_pos)
    }

    fn close(&mut self) {
        self.state.playing.store(false, Ordering::SeqCst);
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Audio context that records players instead of opening a device
#[derive(Default)]
pub struct MockAudioContext {
    players: Mutex<Vec<Arc<MockPlayerState>>>,
    fail: AtomicBool,
}

impl MockAudioContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `new_player` fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn players(&self) -> Vec<Arc<MockPlayerState>> {
        self.players.lock().clone()
    }

    pub fn last_player(&self) -> Option<Arc<MockPlayerState>> {
        self.players.lock().last().cloned()
    }
}

impl AudioContext for MockAudioContext {
    fn new_player(
        &self,
        decoder: Box<dyn PcmDecoder>,
        listener: OutputListener,
    ) -> Result<Box<dyn AudioPlayer>, AudioError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceNotFound);
        }
        let state = Arc::new(MockPlayerState {
            decoder: Mutex::new(decoder),
            listener,
            playing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            volume: Mutex::new(1.0),
            seeks: Mutex::new(Vec::new()),
        });
        self.players.lock().push(state.clone());
        Ok(Box::new(MockPlayer { state }))
    }
}

#[derive(Default)]
struct CatalogState {
    tracks: HashMap<String, (Track, Vec<u8>)>,
    unplayable: HashSet<String>,
    batches: VecDeque<StationBatch>,
    feedback: Vec<StationFeedback>,
    plays: Vec<String>,
    track_requests: usize,
    fail_tracks: bool,
    releases: Vec<(String, Arc<AtomicUsize>)>,
}

/// Catalog serving tracks from memory.
///
/// Download urls have the form `memory://<track id>`.
#[derive(Default)]
pub struct MockCatalog {
    state: Mutex<CatalogState>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_track(&self, track: Track, data: Vec<u8>) {
        self.state
            .lock()
            .tracks
            .insert(track.id.clone(), (track, data));
    }

    /// Resolve metadata but offer no download for `track_id`
    pub fn mark_unplayable(&self, track_id: &str) {
        self.state.lock().unplayable.insert(track_id.to_string());
    }

    pub fn queue_station_batch(&self, batch: StationBatch) {
        self.state.lock().batches.push_back(batch);
    }

    /// Make `tracks` fail until reset
    pub fn set_fail_tracks(&self, fail: bool) {
        self.state.lock().fail_tracks = fail;
    }

    pub fn feedback(&self) -> Vec<StationFeedback> {
        self.state.lock().feedback.clone()
    }

    pub fn plays(&self) -> Vec<String> {
        self.state.lock().plays.clone()
    }

    /// Times each opened stream's source was closed, in open order
    pub fn stream_releases(&self, track_id: &str) -> Vec<usize> {
        self.state
            .lock()
            .releases
            .iter()
            .filter(|(id, _)| id == track_id)
            .map(|(_, count)| count.load(Ordering::SeqCst))
            .collect()
    }

    /// Number of metadata lookups made so far
    pub fn track_requests(&self) -> usize {
        self.state.lock().track_requests
    }
}

#[async_trait::async_trait]
impl Catalog for MockCatalog {
    async fn tracks(&self, ids: &[String]) -> Result<Vec<Track>, CatalogError> {
        let mut state = self.state.lock();
        state.track_requests += 1;
        if state.fail_tracks {
            return Err(CatalogError::Status(503));
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.tracks.get(id).map(|(track, _)| track.clone()))
            .collect())
    }

    async fn download_info(&self, track_id: &str) -> Result<Vec<DownloadInfo>, CatalogError> {
        let state = self.state.lock();
        if state.unplayable.contains(track_id) {
            return Ok(Vec::new());
        }
        if !state.tracks.contains_key(track_id) {
            return Err(CatalogError::NotFound);
        }
        Ok(vec![
            DownloadInfo {
                codec: "mp3".to_string(),
                bitrate_kbps: 192,
                url: format!("memory://{}", track_id),
                direct: true,
            },
            DownloadInfo {
                codec: "mp3".to_string(),
                bitrate_kbps: 320,
                url: format!("memory://{}", track_id),
                direct: true,
            },
        ])
    }

    async fn open_stream(&self, info: &DownloadInfo) -> Result<LiveDownload, CatalogError> {
        let id = info
            .url
            .strip_prefix("memory://")
            .ok_or(CatalogError::NotFound)?;
        let mut state = self.state.lock();
        let (_, data) = state.tracks.get(id).ok_or(CatalogError::NotFound)?;
        let total_len = data.len() as u64;
        let source = MemorySource::new(data.clone());
        state
            .releases
            .push((id.to_string(), source.release_counter()));
        Ok(LiveDownload {
            total_len,
            source: Box::new(source),
        })
    }

    async fn station_tracks(
        &self,
        _station_id: &str,
        _last_track_id: Option<&str>,
    ) -> Result<StationBatch, CatalogError> {
        self.state
            .lock()
            .batches
            .pop_front()
            .ok_or(CatalogError::NotFound)
    }

    async fn station_feedback(
        &self,
        _station_id: &str,
        _batch_id: &str,
        feedback: StationFeedback,
    ) -> Result<(), CatalogError> {
        self.state.lock().feedback.push(feedback);
        Ok(())
    }

    async fn report_play(&self, track: &Track) -> Result<(), CatalogError> {
        self.state.lock().plays.push(track.id.clone());
        Ok(())
    }
}

/// Volume store that keeps every saved value
#[derive(Default)]
pub struct MemoryVolumeStore {
    saved: Mutex<Vec<f64>>,
}

impl MemoryVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<f64> {
        self.saved.lock().clone()
    }
}

impl VolumeStore for MemoryVolumeStore {
    fn load(&self) -> Result<Option<f64>, ConfigError> {
        Ok(self.saved.lock().last().copied())
    }

    fn save(&self, volume: f64) -> Result<(), ConfigError> {
        self.saved.lock().push(volume);
        Ok(())
    }
}
