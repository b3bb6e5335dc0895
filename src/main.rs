use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tuneline::catalog::{artist_list, Catalog, HttpCatalog};
use tuneline::config::{Config, JsonVolumeStore, VolumeStore};
use tuneline::playback::{
    BufferingConfig, CpalAudioContext, PlaybackDeps, PlaybackHandle, PlaybackProgress,
    PlaybackService, PlaybackSettings, PlaybackState, QueueKind, SymphoniaDecoderFactory,
};
use tuneline::remote::{PutStateRequest, RemoteConfig, RemoteSession};

const USAGE: &str = "usage: tuneline <track id>... | tuneline --station <station id>";

const HELP: &str =
    "p play/pause  n next  b previous  f forward  r rewind  + louder  - quieter  s shuffle  x stop  q quit";

enum Start {
    Tracks(Vec<String>),
    Station(String),
}

fn parse_args() -> Option<Start> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => None,
        [flag, station] if flag == "--station" => Some(Start::Station(station.clone())),
        ids if ids.iter().all(|id| !id.starts_with('-')) => Some(Start::Tracks(ids.to_vec())),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tuneline=info")),
        )
        .init();

    let Some(start) = parse_args() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = Config::load()?;
    let runtime = tokio::runtime::Handle::current();

    let volume_store: Arc<dyn VolumeStore> = Arc::new(JsonVolumeStore::in_config_dir()?);
    let volume = match volume_store.load() {
        Ok(saved) => saved.unwrap_or(config.volume),
        Err(e) => {
            warn!("Ignoring saved volume: {}", e);
            config.volume
        }
    };

    let catalog: Arc<dyn Catalog> = Arc::new(HttpCatalog::new(
        config.api_url.clone(),
        config.token.clone(),
        runtime.clone(),
        config.read_timeout,
    )?);

    let deps = PlaybackDeps {
        catalog: catalog.clone(),
        audio: Arc::new(CpalAudioContext::new(config.buffer)?),
        decoders: Arc::new(SymphoniaDecoderFactory),
        volume_store,
    };
    let settings = PlaybackSettings {
        device_id: config.device_id.clone(),
        volume,
        volume_step: config.volume_step,
        buffering: BufferingConfig {
            watermark: config.prefetch_bytes,
            ..BufferingConfig::default()
        },
    };

    let (outbound_tx, outbound_rx) = tokio_mpsc::unbounded_channel();
    let transport = config.remote_url.as_ref().map(|_| outbound_tx);
    let playback = PlaybackService::start(deps, settings, transport, runtime);

    let _remote = match &config.remote_url {
        Some(url) => {
            let remote_config = RemoteConfig {
                url: url.clone(),
                token: config.token.clone(),
            };
            let handshake = PutStateRequest::initial(
                &config.device_id,
                &config.device_name,
                volume,
                config.volume_step,
            );
            match RemoteSession::connect(&remote_config, handshake, outbound_rx, playback.clone())
                .await
            {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!("Remote sync unavailable: {}", e);
                    None
                }
            }
        }
        None => None,
    };

    tokio::spawn(print_progress(playback.clone()));

    match start {
        Start::Tracks(ids) => {
            let tracks = catalog.tracks(&ids).await?;
            if tracks.is_empty() {
                error!("None of the requested tracks were found");
                return Ok(());
            }
            playback.play_queue(QueueKind::Finite, tracks, 0);
        }
        Start::Station(station_id) => {
            let batch = catalog.station_tracks(&station_id, None).await?;
            playback.play_queue(
                QueueKind::Station {
                    station_id,
                    batch_id: batch.batch_id,
                },
                batch.tracks,
                0,
            );
        }
    }

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "p" => playback.toggle_pause(),
            "n" => playback.next(),
            "b" => playback.previous(),
            "f" => playback.rewind(config.rewind, true),
            "r" => playback.rewind(config.rewind, false),
            "+" => playback.volume_up(),
            "-" => playback.volume_down(),
            "s" => playback.shuffle(),
            "x" => playback.stop(),
            "q" => break,
            "" => {}
            _ => println!("{}", HELP),
        }
    }

    playback.shutdown();
    info!("Bye");
    Ok(())
}

async fn print_progress(playback: PlaybackHandle) {
    let mut progress = playback.subscribe_progress();
    while let Some(update) = progress.recv().await {
        match update {
            PlaybackProgress::StateChanged {
                state: PlaybackState::Playing { track, .. },
            } => println!(
                "▶ {} - {}",
                artist_list(&track.artists),
                track.display_title()
            ),
            PlaybackProgress::StateChanged {
                state: PlaybackState::Paused { track, .. },
            } => println!("⏸ {}", track.display_title()),
            PlaybackProgress::StateChanged {
                state: PlaybackState::Stopped,
            } => println!("■ stopped"),
            PlaybackProgress::VolumeChanged { volume } => {
                println!("volume {:.0}%", volume * 100.0)
            }
            _ => {}
        }
    }
}
