use crate::catalog::Track;
use crate::playback::decoder::DecoderFactory;
use crate::playback::output::{AudioContext, AudioPlayer, OutputEvent, OutputListener, FRAME_BYTES};
use crate::playback::streaming::BufferedStream;
use crate::remote::protocol::{PlayingStatus, PutStateRequest};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};

/// Who asked for a transport change. Only local changes are forwarded to the
/// remote session; remote ones are applied silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Loaded,
    Playing,
    Paused,
    Stopped,
}

/// Receives `(session id, event)` for every player the controller creates
pub type SessionListener = Arc<dyn Fn(u64, OutputEvent) + Send + Sync>;

/// One track bound to its stream, decoder and output
struct Session {
    id: u64,
    track: Track,
    stream: BufferedStream,
    player: Box<dyn AudioPlayer>,
}

/// Drives one decoder and output from a buffered stream
pub struct PlaybackController {
    context: Arc<dyn AudioContext>,
    decoders: Arc<dyn DecoderFactory>,
    listener: SessionListener,
    session: Option<Session>,
    track: Option<Track>,
    state: PlayerState,
    volume: f64,
    next_session_id: u64,
    transport: Option<tokio_mpsc::UnboundedSender<PutStateRequest>>,
    synchronized: bool,
}

impl PlaybackController {
    pub fn new(
        context: Arc<dyn AudioContext>,
        decoders: Arc<dyn DecoderFactory>,
        listener: SessionListener,
        volume: f64,
    ) -> Self {
        Self {
            context,
            decoders,
            listener,
            session: None,
            track: None,
            state: PlayerState::Idle,
            volume: volume.clamp(0.0, 1.0),
            next_session_id: 1,
            transport: None,
            synchronized: false,
        }
    }

    /// Route local transport changes to a remote session
    pub fn set_transport(&mut self, transport: Option<tokio_mpsc::UnboundedSender<PutStateRequest>>) {
        self.transport = transport;
    }

    /// Whether the current queue is linked to the remote session
    pub fn set_synchronized(&mut self, synchronized: bool) {
        self.synchronized = synchronized;
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized && self.transport.is_some()
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    /// Last track handed to [`start_track`](Self::start_track), kept after stop
    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlayerState::Playing
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Position as a fraction of the stream
    pub fn progress(&self) -> f64 {
        self.session
            .as_ref()
            .map(|s| s.stream.progress())
            .unwrap_or(0.0)
    }

    /// Position in milliseconds, derived from the stream cursor and track duration
    pub fn position_ms(&self) -> i64 {
        let Some(session) = self.session.as_ref() else {
            return 0;
        };
        let len = session.stream.len() as u128;
        if len == 0 {
            return 0;
        }
        let cursor = session.stream.position() as u128;
        (session.track.duration_ms as u128 * cursor / len) as i64
    }

    /// Byte position of the stream cursor
    pub fn stream_position(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.stream.position())
    }

    pub fn buffering_progress(&self) -> f64 {
        self.session
            .as_ref()
            .map(|s| s.stream.buffering_progress())
            .unwrap_or(0.0)
    }

    /// Replace any running session with `track` read from `stream`.
    /// Returns false when the stream cannot be decoded or output fails.
    pub fn start_track(&mut self, track: Track, stream: BufferedStream) -> bool {
        self.stop();
        self.track = Some(track.clone());

        let Some((id, mut player)) = self.open_player(&stream) else {
            if let Err(e) = stream.close() {
                debug!("Closing rejected stream failed: {}", e);
            }
            return false;
        };

        self.state = PlayerState::Loaded;
        player.set_volume(self.volume);
        player.play();
        self.state = PlayerState::Playing;

        info!("Started track {} ({})", track.id, track.display_title());
        self.session = Some(Session {
            id,
            track,
            stream,
            player,
        });
        true
    }

    fn open_player(&mut self, stream: &BufferedStream) -> Option<(u64, Box<dyn AudioPlayer>)> {
        let decoder = match self.decoders.open(stream.clone()) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!("Decoder rejected stream: {}", e);
                return None;
            }
        };

        let id = self.next_session_id;
        self.next_session_id += 1;

        let listener = self.listener.clone();
        let output_listener: OutputListener = Arc::new(move |event| listener(id, event));
        match self.context.new_player(decoder, output_listener) {
            Ok(player) => Some((id, player)),
            Err(e) => {
                warn!("Failed to create output player: {}", e);
                None
            }
        }
    }

    pub fn play(&mut self, provenance: Provenance) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if self.state == PlayerState::Playing {
            return;
        }
        session.player.play();
        self.state = PlayerState::Playing;
        self.report(provenance);
    }

    pub fn pause(&mut self, provenance: Provenance) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if self.state != PlayerState::Playing {
            return;
        }
        session.player.pause();
        self.state = PlayerState::Paused;
        self.report(provenance);
    }

    pub fn toggle(&mut self, provenance: Provenance) {
        if self.state == PlayerState::Playing {
            self.pause(provenance);
        } else {
            self.play(provenance);
        }
    }

    /// Tear down the session. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            if session.player.is_playing() {
                session.player.pause();
            }
            if let Err(e) = session.player.seek(SeekFrom::Start(0)) {
                debug!("Rewinding decoder on stop failed: {}", e);
            }
            if let Err(e) = session.stream.close() {
                warn!("Failed to close stream for {}: {}", session.track.id, e);
            }
            session.player.close();
            debug!("Stopped session {}", session.id);
        }
        self.state = PlayerState::Stopped;
    }

    /// Move by `delta_ms` relative to the current position.
    /// Returns the new byte position, or None without a session.
    pub fn rewind(&mut self, delta_ms: i64, provenance: Provenance) -> Option<u64> {
        let session = self.session.as_mut()?;
        let len = session.stream.len() as i64;
        let duration_ms = session.track.duration_ms as i64;
        if duration_ms <= 0 || len == 0 {
            return None;
        }

        let current = session.stream.position() as i64;
        let offset = (len as f64 / duration_ms as f64 * delta_ms as f64).round() as i64;
        let mut pos = current + offset;
        pos -= pos.rem_euclid(FRAME_BYTES as i64);

        let target = if pos <= 0 {
            SeekFrom::Start(0)
        } else if pos >= len {
            SeekFrom::End(0)
        } else {
            SeekFrom::Start(pos as u64)
        };

        let new_pos = match session.player.seek(target) {
            Ok(new_pos) => new_pos,
            Err(e) => {
                warn!("Seek by {} ms failed: {}", delta_ms, e);
                return None;
            }
        };
        debug!("Rewind {} ms: {} -> {}", delta_ms, current, new_pos);

        self.report(provenance);
        Some(new_pos)
    }

    pub fn set_volume(&mut self, volume: f64) {
        self.volume = volume.clamp(0.0, 1.0);
        if let Some(session) = self.session.as_mut() {
            session.player.set_volume(self.volume);
        }
    }

    /// Rebuild decoder and output over the same stream after the output died,
    /// resuming where it stopped. Falls back to Stopped when that fails.
    pub fn restart_track(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        let resume = self.state == PlayerState::Playing;
        session.player.close();

        let progress = session.stream.progress();
        info!(
            "Restarting track {} at {:.1}%",
            session.track.id,
            progress * 100.0
        );

        let Some((id, mut player)) = self.open_player(&session.stream) else {
            return self.abandon(session);
        };

        // Opening the decoder may have read a header; resume relative to the start
        if let Err(e) = session.stream.seek_to(SeekFrom::Start(0)) {
            warn!("Restart failed to rewind stream: {}", e);
            player.close();
            return self.abandon(session);
        }

        player.set_volume(self.volume);
        self.state = PlayerState::Loaded;
        let resume_at = (session.track.duration_ms as f64 * progress) as i64;
        self.session = Some(Session {
            id,
            player,
            ..session
        });
        self.rewind(resume_at, Provenance::Remote);

        if let Some(session) = self.session.as_mut() {
            if resume {
                session.player.play();
                self.state = PlayerState::Playing;
            } else {
                self.state = PlayerState::Paused;
            }
        }
        true
    }

    fn abandon(&mut self, session: Session) -> bool {
        if let Err(e) = session.stream.close() {
            debug!("Closing abandoned stream failed: {}", e);
        }
        self.state = PlayerState::Stopped;
        false
    }

    /// Current transport status as the remote session sees it
    pub fn playing_status(&self) -> PlayingStatus {
        PlayingStatus {
            progress_ms: self.position_ms(),
            duration_ms: self
                .session
                .as_ref()
                .map(|s| s.track.duration_ms as i64)
                .unwrap_or(0),
            paused: self.state != PlayerState::Playing,
            playback_speed: 1.0,
        }
    }

    fn report(&self, provenance: Provenance) {
        if provenance != Provenance::Local || !self.synchronized {
            return;
        }
        if let Some(transport) = &self.transport {
            let _ = transport.send(PutStateRequest::UpdatePlayingStatus {
                playing_status: self.playing_status(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::decoder::{DecoderError, PcmDecoder, RawPcmDecoderFactory};
    use crate::playback::streaming::BufferingConfig;
    use crate::test_support::{test_track, MemorySource, MockAudioContext, RejectingDecoderFactory};
    use std::io::Read;
    use std::time::Duration;

    fn stream_of(len: usize) -> BufferedStream {
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        BufferedStream::new(
            Box::new(MemorySource::new(data)),
            len as u64,
            BufferingConfig {
                chunk_size: 256,
                watermark: 256,
                period: Duration::from_millis(10),
            },
        )
    }

    fn controller(context: Arc<MockAudioContext>) -> PlaybackController {
        PlaybackController::new(
            context,
            Arc::new(RawPcmDecoderFactory),
            Arc::new(|_, _| {}),
            0.5,
        )
    }

    #[test]
    fn test_rewind_maps_time_to_bytes() {
        let context = Arc::new(MockAudioContext::new());
        let mut controller = controller(context);
        assert!(controller.start_track(test_track("t1", 200_000), stream_of(3_200_000)));

        let pos = controller.rewind(5_000, Provenance::Local);

        assert_eq!(pos, Some(80_000));
        assert_eq!(controller.stream_position(), Some(80_000));
    }

    #[test]
    fn test_rewind_there_and_back_lands_within_one_frame() {
        let context = Arc::new(MockAudioContext::new());
        let mut controller = controller(context);
        controller.start_track(test_track("t1", 187_000), stream_of(1_000_003));
        controller.rewind(41_234, Provenance::Local);
        let start = controller.stream_position().unwrap();

        controller.rewind(3_333, Provenance::Local);
        controller.rewind(-3_333, Provenance::Local);

        let end = controller.stream_position().unwrap();
        assert!(start.abs_diff(end) <= FRAME_BYTES, "{} vs {}", start, end);
    }

    #[test]
    fn test_rewind_clamps_to_stream_bounds() {
        let context = Arc::new(MockAudioContext::new());
        let mut controller = controller(context);
        controller.start_track(test_track("t1", 10_000), stream_of(40_000));

        assert_eq!(controller.rewind(-5_000, Provenance::Local), Some(0));
        assert_eq!(controller.rewind(60_000, Provenance::Local), Some(40_000));
    }

    #[test]
    fn test_rewind_without_session_is_noop() {
        let context = Arc::new(MockAudioContext::new());
        let mut controller = controller(context);
        assert_eq!(controller.rewind(1_000, Provenance::Local), None);
    }

    #[test]
    fn test_stop_is_idempotent_and_closes_stream() {
        let context = Arc::new(MockAudioContext::new());
        let mut controller = controller(context.clone());
        let stream = stream_of(10_000);
        controller.start_track(test_track("t1", 10_000), stream.clone());

        controller.stop();
        controller.stop();

        assert_eq!(controller.state(), PlayerState::Stopped);
        assert!(stream.is_closed());
        assert!(context.last_player().unwrap().is_closed());
        assert_eq!(controller.track().map(|t| t.id.as_str()), Some("t1"));
    }

    #[test]
    fn test_decoder_rejection_creates_no_session() {
        let context = Arc::new(MockAudioContext::new());
        let mut controller = PlaybackController::new(
            context.clone(),
            Arc::new(RejectingDecoderFactory),
            Arc::new(|_, _| {}),
            1.0,
        );

        assert!(!controller.start_track(test_track("bad", 1_000), stream_of(4_000)));
        assert!(!controller.has_session());
        assert!(context.players().is_empty());
    }

    #[test]
    fn test_pause_and_play_are_guarded() {
        let context = Arc::new(MockAudioContext::new());
        let mut controller = controller(context.clone());
        controller.pause(Provenance::Local);
        assert_eq!(controller.state(), PlayerState::Idle);

        controller.start_track(test_track("t1", 10_000), stream_of(4_000));
        controller.pause(Provenance::Local);
        controller.pause(Provenance::Local);
        assert_eq!(controller.state(), PlayerState::Paused);
        assert!(!context.last_player().unwrap().is_playing());

        controller.toggle(Provenance::Local);
        assert_eq!(controller.state(), PlayerState::Playing);
    }

    #[test]
    fn test_only_local_changes_are_forwarded() {
        let context = Arc::new(MockAudioContext::new());
        let mut controller = controller(context);
        let (tx, mut rx) = tokio_mpsc::unbounded_channel();
        controller.set_transport(Some(tx));
        controller.set_synchronized(true);
        controller.start_track(test_track("t1", 10_000), stream_of(40_000));

        controller.pause(Provenance::Remote);
        controller.play(Provenance::Remote);
        controller.rewind(1_000, Provenance::Remote);
        assert!(rx.try_recv().is_err());

        controller.pause(Provenance::Local);
        match rx.try_recv() {
            Ok(PutStateRequest::UpdatePlayingStatus { playing_status }) => {
                assert!(playing_status.paused);
                assert_eq!(playing_status.duration_ms, 10_000);
            }
            other => panic!("unexpected outbound message: {:?}", other),
        }
    }

    #[test]
    fn test_restart_resumes_at_previous_position() {
        let context = Arc::new(MockAudioContext::new());
        let mut controller = controller(context.clone());
        controller.start_track(test_track("t1", 100_000), stream_of(400_000));
        controller.rewind(25_000, Provenance::Local);
        let before = controller.stream_position().unwrap();

        assert!(controller.restart_track());

        assert_eq!(controller.state(), PlayerState::Playing);
        assert_eq!(context.players().len(), 2);
        assert!(context.players()[0].is_closed());
        let after = controller.stream_position().unwrap();
        assert!(before.abs_diff(after) <= FRAME_BYTES);
    }

    /// Consumes a fixed-size header on open, like a probing decoder does
    struct HeaderReadingFactory {
        header: usize,
    }

    impl DecoderFactory for HeaderReadingFactory {
        fn open(
            &self,
            mut stream: BufferedStream,
        ) -> Result<Box<dyn PcmDecoder>, DecoderError> {
            let mut header = vec![0u8; self.header];
            stream.read_exact(&mut header).unwrap();
            Ok(Box::new(stream))
        }
    }

    #[test]
    fn test_restart_ignores_bytes_read_while_opening_decoder() {
        let context = Arc::new(MockAudioContext::new());
        let mut controller = PlaybackController::new(
            context.clone(),
            Arc::new(HeaderReadingFactory { header: 4096 }),
            Arc::new(|_, _| {}),
            0.5,
        );
        controller.start_track(test_track("t1", 100_000), stream_of(400_000));
        controller.rewind(25_000, Provenance::Local);
        let before = controller.stream_position().unwrap();
        assert_eq!(before, 104_096);

        assert!(controller.restart_track());

        let after = controller.stream_position().unwrap();
        assert!(before.abs_diff(after) <= FRAME_BYTES, "{} vs {}", before, after);
        assert_eq!(context.last_player().unwrap().seeks().last(), Some(&after));
    }

    #[test]
    fn test_failed_restart_stops_and_closes_stream() {
        let context = Arc::new(MockAudioContext::new());
        let mut controller = controller(context.clone());
        let stream = stream_of(40_000);
        controller.start_track(test_track("t1", 10_000), stream.clone());

        context.set_failing(true);
        assert!(!controller.restart_track());

        assert_eq!(controller.state(), PlayerState::Stopped);
        assert!(!controller.has_session());
        assert!(stream.is_closed());
        assert!(context.players()[0].is_closed());
        assert_eq!(controller.track().map(|t| t.id.as_str()), Some("t1"));
    }

    #[test]
    fn test_volume_is_clamped_and_applied() {
        let context = Arc::new(MockAudioContext::new());
        let mut controller = controller(context.clone());
        controller.start_track(test_track("t1", 10_000), stream_of(4_000));
        assert_eq!(context.last_player().unwrap().volume(), 0.5);

        controller.set_volume(1.7);
        assert_eq!(controller.volume(), 1.0);
        assert_eq!(context.last_player().unwrap().volume(), 1.0);
    }
}
