use crate::catalog::{best_download, Catalog, CatalogError, StationFeedback, Track};
use crate::config::VolumeStore;
use crate::playback::controller::{PlaybackController, PlayerState, Provenance, SessionListener};
use crate::playback::decoder::DecoderFactory;
use crate::playback::output::{AudioContext, OutputEvent};
use crate::playback::progress::{PlaybackProgress, PlaybackProgressHandle};
use crate::playback::queue::{Advance, Queue, QueueKind};
use crate::playback::streaming::{BufferedStream, BufferingConfig};
use crate::remote::protocol::{PutStateRequest, PutStateResponse};
use crate::remote::reconcile::{LocalView, Reconciler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Interval between position updates
pub const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Tracks that may fail to start in a row before skipping gives up
const MAX_FAILED_STARTS: u32 = 3;

/// Playback commands sent to the service
#[derive(Debug)]
pub enum PlaybackCommand {
    PlayQueue {
        kind: QueueKind,
        tracks: Vec<Track>,
        start: usize,
    },
    PlayIndex(usize),
    TogglePause,
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    /// Move by this many milliseconds, backwards when negative
    Rewind(i64),
    SetVolume(f64),
    VolumeUp,
    VolumeDown,
    Shuffle,
    Remote(Box<PutStateResponse>),
    Output {
        session: u64,
        event: OutputEvent,
    },
    Tick,
    Status(oneshot::Sender<PlayerStatus>),
    Shutdown,
}

/// Current playback state
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackState {
    Stopped,
    Loading {
        track_id: String,
    },
    Playing {
        track: Track,
        position: Duration,
        duration: Duration,
    },
    Paused {
        track: Track,
        position: Duration,
        duration: Duration,
    },
}

/// Point-in-time view of the control loop, answered on request
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStatus {
    pub state: PlayerState,
    pub track_id: Option<String>,
    pub queue_index: usize,
    pub queue_len: usize,
    pub position_ms: i64,
    pub stream_position: Option<u64>,
    pub volume: f64,
    pub synchronized: bool,
}

/// Handle to the playback service for sending commands
#[derive(Clone)]
pub struct PlaybackHandle {
    command_tx: tokio_mpsc::UnboundedSender<PlaybackCommand>,
    progress_handle: PlaybackProgressHandle,
}

impl PlaybackHandle {
    fn send(&self, command: PlaybackCommand) {
        let _ = self.command_tx.send(command);
    }

    pub fn play_queue(&self, kind: QueueKind, tracks: Vec<Track>, start: usize) {
        self.send(PlaybackCommand::PlayQueue {
            kind,
            tracks,
            start,
        });
    }

    pub fn play_index(&self, index: usize) {
        self.send(PlaybackCommand::PlayIndex(index));
    }

    pub fn toggle_pause(&self) {
        self.send(PlaybackCommand::TogglePause);
    }

    pub fn play(&self) {
        self.send(PlaybackCommand::Play);
    }

    pub fn pause(&self) {
        self.send(PlaybackCommand::Pause);
    }

    pub fn stop(&self) {
        self.send(PlaybackCommand::Stop);
    }

    pub fn next(&self) {
        self.send(PlaybackCommand::Next);
    }

    pub fn previous(&self) {
        self.send(PlaybackCommand::Previous);
    }

    pub fn rewind(&self, delta: Duration, forward: bool) {
        let ms = delta.as_millis() as i64;
        self.send(PlaybackCommand::Rewind(if forward { ms } else { -ms }));
    }

    pub fn set_volume(&self, volume: f64) {
        self.send(PlaybackCommand::SetVolume(volume));
    }

    pub fn volume_up(&self) {
        self.send(PlaybackCommand::VolumeUp);
    }

    pub fn volume_down(&self) {
        self.send(PlaybackCommand::VolumeDown);
    }

    pub fn shuffle(&self) {
        self.send(PlaybackCommand::Shuffle);
    }

    /// Hand a snapshot from the remote session to the control loop
    pub fn apply_remote_state(&self, snapshot: PutStateResponse) {
        self.send(PlaybackCommand::Remote(Box::new(snapshot)));
    }

    pub fn shutdown(&self) {
        self.send(PlaybackCommand::Shutdown);
    }

    /// None once the service has stopped
    pub async fn status(&self) -> Option<PlayerStatus> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(PlaybackCommand::Status(tx)).ok()?;
        rx.await.ok()
    }

    pub fn subscribe_progress(&self) -> tokio_mpsc::UnboundedReceiver<PlaybackProgress> {
        self.progress_handle.subscribe_all()
    }
}

/// Everything the control loop talks to
#[derive(Clone)]
pub struct PlaybackDeps {
    pub catalog: Arc<dyn Catalog>,
    pub audio: Arc<dyn AudioContext>,
    pub decoders: Arc<dyn DecoderFactory>,
    pub volume_store: Arc<dyn VolumeStore>,
}

#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub device_id: String,
    pub volume: f64,
    pub volume_step: f64,
    pub buffering: BufferingConfig,
}

/// Playback service: a single control loop owning the controller, the queue
/// and the remote reconciler
pub struct PlaybackService {
    catalog: Arc<dyn Catalog>,
    volume_store: Arc<dyn VolumeStore>,
    controller: PlaybackController,
    queue: Queue,
    reconciler: Option<Reconciler>,
    remote_state: Option<PutStateResponse>,
    transport: Option<tokio_mpsc::UnboundedSender<PutStateRequest>>,
    buffering: BufferingConfig,
    volume_step: f64,
    failed_starts: u32,
    command_tx: tokio_mpsc::WeakUnboundedSender<PlaybackCommand>,
    command_rx: tokio_mpsc::UnboundedReceiver<PlaybackCommand>,
    progress_tx: tokio_mpsc::UnboundedSender<PlaybackProgress>,
}

impl PlaybackService {
    /// Start the control loop on a dedicated thread. Outbound remote messages
    /// go to `transport` when one is given. Progress is dispatched on
    /// `runtime_handle`.
    pub fn start(
        deps: PlaybackDeps,
        settings: PlaybackSettings,
        transport: Option<tokio_mpsc::UnboundedSender<PutStateRequest>>,
        runtime_handle: tokio::runtime::Handle,
    ) -> PlaybackHandle {
        let (command_tx, command_rx) = tokio_mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = tokio_mpsc::unbounded_channel();

        let progress_handle = PlaybackProgressHandle::new(progress_rx, runtime_handle);

        let handle = PlaybackHandle {
            command_tx: command_tx.clone(),
            progress_handle,
        };

        // Internal senders are weak so the loop ends once every handle is gone
        let weak_tx = command_tx.downgrade();
        drop(command_tx);

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to create playback runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async move {
                let listener_tx = weak_tx.clone();
                let listener: SessionListener = Arc::new(move |session, event| {
                    if let Some(tx) = listener_tx.upgrade() {
                        let _ = tx.send(PlaybackCommand::Output { session, event });
                    }
                });

                let mut controller = PlaybackController::new(
                    deps.audio,
                    deps.decoders,
                    listener,
                    settings.volume,
                );
                controller.set_transport(transport.clone());

                tokio::spawn(tick_loop(weak_tx.clone()));

                let mut service = PlaybackService {
                    catalog: deps.catalog,
                    volume_store: deps.volume_store,
                    controller,
                    queue: Queue::default(),
                    reconciler: transport
                        .as_ref()
                        .map(|_| Reconciler::new(settings.device_id.clone())),
                    remote_state: None,
                    transport,
                    buffering: settings.buffering,
                    volume_step: settings.volume_step,
                    failed_starts: 0,
                    command_tx: weak_tx,
                    command_rx,
                    progress_tx,
                };

                service.run().await;
            });
        });

        handle
    }

    async fn run(&mut self) {
        info!("PlaybackService started");

        while let Some(command) = self.command_rx.recv().await {
            match command {
                PlaybackCommand::PlayQueue {
                    kind,
                    tracks,
                    start,
                } => self.play_queue(kind, tracks, start).await,
                PlaybackCommand::PlayIndex(index) => self.play_index(index).await,
                PlaybackCommand::TogglePause => {
                    self.controller.toggle(Provenance::Local);
                    self.publish_state();
                }
                PlaybackCommand::Play => {
                    self.controller.play(Provenance::Local);
                    self.publish_state();
                }
                PlaybackCommand::Pause => {
                    self.controller.pause(Provenance::Local);
                    self.publish_state();
                }
                PlaybackCommand::Stop => {
                    self.controller.stop();
                    self.publish_state();
                }
                PlaybackCommand::Next => self.next_track(false).await,
                PlaybackCommand::Previous => self.previous_track().await,
                PlaybackCommand::Rewind(delta_ms) => {
                    self.controller.rewind(delta_ms, Provenance::Local);
                    self.publish_position();
                }
                PlaybackCommand::SetVolume(volume) => self.set_volume(volume),
                PlaybackCommand::VolumeUp => {
                    self.set_volume(self.controller.volume() + self.volume_step)
                }
                PlaybackCommand::VolumeDown => {
                    self.set_volume(self.controller.volume() - self.volume_step)
                }
                PlaybackCommand::Shuffle => {
                    if self.queue.shuffle() {
                        info!("Shuffled {} tracks", self.queue.len());
                        self.publish_queue();
                    }
                }
                PlaybackCommand::Remote(snapshot) => self.apply_remote(*snapshot).await,
                PlaybackCommand::Output { session, event } => {
                    self.handle_output(session, event).await
                }
                PlaybackCommand::Tick => self.publish_position(),
                PlaybackCommand::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                PlaybackCommand::Shutdown => {
                    self.controller.stop();
                    break;
                }
            }
        }

        self.controller.stop();
        info!("PlaybackService stopped");
    }

    async fn play_queue(&mut self, kind: QueueKind, tracks: Vec<Track>, start: usize) {
        if let QueueKind::Station {
            station_id,
            batch_id,
        } = &kind
        {
            self.send_feedback(station_id, batch_id, StationFeedback::RadioStarted);
        }

        info!("Playing queue of {} tracks from {}", tracks.len(), start);
        self.queue = Queue::new(kind, tracks, start);
        self.controller.set_synchronized(self.queue.is_remote());
        self.failed_starts = 0;
        self.publish_queue();

        self.play_current(Provenance::Local).await;
    }

    /// Selecting the track that is already loaded toggles it instead
    async fn play_index(&mut self, index: usize) {
        let loaded = self.controller.has_session()
            && index == self.queue.index()
            && self.controller.track().map(|t| &t.id)
                == self.queue.current_track().map(|t| &t.id);
        if loaded {
            self.controller.toggle(Provenance::Local);
            self.publish_state();
            return;
        }

        if !self.queue.select(index) {
            warn!("No track at index {} (queue has {})", index, self.queue.len());
            return;
        }
        self.publish_queue();
        self.play_current(Provenance::Local).await;
    }

    /// Start the queue's current track. Locally initiated starts that fail are
    /// skipped, a bounded number of times in a row.
    async fn play_current(&mut self, provenance: Provenance) -> bool {
        self.controller.stop();

        let Some(track) = self.queue.current_track().cloned() else {
            self.publish_state();
            return false;
        };

        self.publish(PlaybackProgress::StateChanged {
            state: PlaybackState::Loading {
                track_id: track.id.clone(),
            },
        });

        let started = match self.open_track(&track).await {
            Ok(stream) => self.controller.start_track(track.clone(), stream),
            Err(e) => {
                warn!("Failed to load track {}: {}", track.id, e);
                false
            }
        };

        if !started {
            self.publish_state();
            self.failed_starts += 1;
            if provenance == Provenance::Local && self.failed_starts < MAX_FAILED_STARTS {
                info!("Skipping unplayable track {}", track.id);
                if let Some(tx) = self.command_tx.upgrade() {
                    let _ = tx.send(PlaybackCommand::Next);
                }
            }
            return false;
        }

        self.failed_starts = 0;
        self.publish_state();

        if let QueueKind::Station {
            station_id,
            batch_id,
        } = self.queue.kind()
        {
            self.send_feedback(
                station_id,
                batch_id,
                StationFeedback::TrackStarted {
                    track_id: track.id.clone(),
                },
            );
        }
        self.report_play(&track);

        if provenance == Provenance::Local {
            self.announce_track_change();
        }
        true
    }

    async fn open_track(&self, track: &Track) -> Result<BufferedStream, CatalogError> {
        let infos = self.catalog.download_info(&track.id).await?;
        let best = best_download(&infos)
            .ok_or_else(|| CatalogError::NoDownloadOptions(track.id.clone()))?;
        debug!(
            "Downloading {} as {} {} kbps",
            track.id, best.codec, best.bitrate_kbps
        );
        let download = self.catalog.open_stream(best).await?;
        Ok(BufferedStream::new(
            download.source,
            download.total_len,
            self.buffering.clone(),
        ))
    }

    /// `finished` is true when the track played to its end rather than being
    /// skipped
    async fn next_track(&mut self, finished: bool) {
        if self.queue.is_empty() {
            return;
        }

        if let QueueKind::Station {
            station_id,
            batch_id,
        } = self.queue.kind().clone()
        {
            if let Some(track) = self.controller.track() {
                let track_id = track.id.clone();
                let played_secs = self.controller.position_ms() as f64 / 1000.0;
                let feedback = if finished {
                    StationFeedback::TrackFinished {
                        track_id,
                        played_secs,
                    }
                } else {
                    StationFeedback::Skip {
                        track_id,
                        played_secs,
                    }
                };
                self.send_feedback(&station_id, &batch_id, feedback);
            }

            if self.queue.needs_more() {
                let last = self.queue.tracks().last().map(|t| t.id.clone());
                match self
                    .catalog
                    .station_tracks(&station_id, last.as_deref())
                    .await
                {
                    Ok(batch) => {
                        debug!("Station batch {}: {} tracks", batch.batch_id, batch.tracks.len());
                        self.queue.extend_station(batch.batch_id, batch.tracks);
                    }
                    Err(e) => {
                        warn!("Failed to fetch station tracks: {}", e);
                        return;
                    }
                }
            }
        }

        match self.queue.advance() {
            Advance::Moved => {
                self.publish_queue();
                self.play_current(Provenance::Local).await;
            }
            Advance::End => {
                info!("Reached end of queue");
                self.controller.stop();
                self.publish_queue();
                self.publish_state();
            }
            Advance::Empty => {}
        }
    }

    async fn previous_track(&mut self) {
        if !self.queue.retreat() {
            self.controller.stop();
            self.publish_state();
            return;
        }
        self.publish_queue();
        self.play_current(Provenance::Local).await;
    }

    /// Tell the remote session about a locally chosen track
    fn announce_track_change(&mut self) {
        if !self.controller.is_synchronized() || !self.queue.is_remote() {
            return;
        }
        let (Some(snapshot), Some(track), Some(transport)) = (
            self.remote_state.as_mut(),
            self.queue.current_track(),
            self.transport.as_ref(),
        ) else {
            return;
        };

        let player_state = &mut snapshot.player_state;
        player_state.player_queue.current_playable_index = self.queue.index() as i64;
        player_state.status.progress_ms = 0;
        player_state.status.duration_ms = track.duration_ms as i64;
        player_state.status.paused = !self.controller.is_playing();

        let _ = transport.send(PutStateRequest::UpdatePlayerState {
            player_state: player_state.clone(),
        });
    }

    async fn apply_remote(&mut self, snapshot: PutStateResponse) {
        let Some(reconciler) = &self.reconciler else {
            return;
        };

        let plan = {
            let local = LocalView {
                playing_track_id: self.controller.track().map(|t| t.id.as_str()),
                position_ms: self.controller.position_ms(),
                volume: self.controller.volume(),
                known_track_count: self.queue.is_remote().then(|| self.queue.len()),
            };
            reconciler.plan(&snapshot, &local)
        };
        self.remote_state = Some(snapshot);

        let Some(plan) = plan else {
            debug!("Remote snapshot targets another device");
            return;
        };

        if let Some(update) = plan.queue {
            if update.refetch {
                match self.catalog.tracks(&update.track_ids).await {
                    Ok(tracks) => {
                        self.queue = Queue::new(QueueKind::Remote, tracks, update.current);
                    }
                    Err(e) => {
                        warn!("Failed to fetch remote queue: {}", e);
                        return;
                    }
                }
            } else {
                self.queue.select(update.current);
            }
            self.controller.set_synchronized(true);
            self.publish_queue();
        }

        if plan.switch_track {
            self.play_current(Provenance::Remote).await;
        }
        if let Some(delta_ms) = plan.seek_delta_ms {
            self.controller.rewind(delta_ms, Provenance::Remote);
        }
        if let Some(paused) = plan.paused {
            if paused {
                self.controller.pause(Provenance::Remote);
            } else {
                self.controller.play(Provenance::Remote);
            }
        }
        if let Some(volume) = plan.volume {
            self.set_volume(volume);
        }

        self.publish_state();
    }

    async fn handle_output(&mut self, session: u64, event: OutputEvent) {
        if self.controller.session_id() != Some(session) {
            debug!("Ignoring {:?} from stale session {}", event, session);
            return;
        }

        match event {
            OutputEvent::Finished => {
                if let Some(track) = self.controller.track() {
                    self.publish(PlaybackProgress::TrackCompleted {
                        track_id: track.id.clone(),
                    });
                }
                self.next_track(true).await;
            }
            OutputEvent::UnexpectedStop => {
                warn!("Output stopped unexpectedly, restarting track");
                if !self.controller.restart_track() {
                    error!("Restart failed, playback stopped");
                }
                self.publish_state();
            }
        }
    }

    fn set_volume(&mut self, volume: f64) {
        self.controller.set_volume(volume);
        let volume = self.controller.volume();
        if let Err(e) = self.volume_store.save(volume) {
            warn!("Failed to persist volume: {}", e);
        }
        self.publish(PlaybackProgress::VolumeChanged { volume });
    }

    fn send_feedback(&self, station_id: &str, batch_id: &str, feedback: StationFeedback) {
        let catalog = self.catalog.clone();
        let station_id = station_id.to_string();
        let batch_id = batch_id.to_string();
        tokio::spawn(async move {
            let kind = feedback.kind();
            if let Err(e) = catalog
                .station_feedback(&station_id, &batch_id, feedback)
                .await
            {
                warn!("Station feedback {} failed: {}", kind, e);
            }
        });
    }

    fn report_play(&self, track: &Track) {
        let catalog = self.catalog.clone();
        let track = track.clone();
        tokio::spawn(async move {
            if let Err(e) = catalog.report_play(&track).await {
                debug!("Play report for {} failed: {}", track.id, e);
            }
        });
    }

    fn status(&self) -> PlayerStatus {
        PlayerStatus {
            state: self.controller.state(),
            track_id: self.controller.track().map(|t| t.id.clone()),
            queue_index: self.queue.index(),
            queue_len: self.queue.len(),
            position_ms: self.controller.position_ms(),
            stream_position: self.controller.stream_position(),
            volume: self.controller.volume(),
            synchronized: self.controller.is_synchronized(),
        }
    }

    fn current_state(&self) -> PlaybackState {
        let track = match self.controller.track() {
            Some(track) if self.controller.has_session() => track.clone(),
            _ => return PlaybackState::Stopped,
        };
        let position = Duration::from_millis(self.controller.position_ms().max(0) as u64);
        let duration = Duration::from_millis(track.duration_ms);
        match self.controller.state() {
            PlayerState::Playing => PlaybackState::Playing {
                track,
                position,
                duration,
            },
            PlayerState::Paused | PlayerState::Loaded => PlaybackState::Paused {
                track,
                position,
                duration,
            },
            PlayerState::Idle | PlayerState::Stopped => PlaybackState::Stopped,
        }
    }

    fn publish(&self, progress: PlaybackProgress) {
        let _ = self.progress_tx.send(progress);
    }

    fn publish_state(&self) {
        self.publish(PlaybackProgress::StateChanged {
            state: self.current_state(),
        });
    }

    fn publish_queue(&self) {
        self.publish(PlaybackProgress::QueueChanged {
            index: self.queue.index(),
            len: self.queue.len(),
        });
    }

    fn publish_position(&self) {
        if !self.controller.is_playing() {
            return;
        }
        let Some(track) = self.controller.track() else {
            return;
        };
        self.publish(PlaybackProgress::PositionUpdate {
            track_id: track.id.clone(),
            position: Duration::from_millis(self.controller.position_ms().max(0) as u64),
            duration: Duration::from_millis(track.duration_ms),
            buffered: self.controller.buffering_progress(),
        });
    }
}

async fn tick_loop(command_tx: tokio_mpsc::WeakUnboundedSender<PlaybackCommand>) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let Some(tx) = command_tx.upgrade() else {
            break;
        };
        if tx.send(PlaybackCommand::Tick).is_err() {
            break;
        }
    }
}
