use super::models::{DownloadInfo, StationBatch, StationFeedback, Track};
use super::{Catalog, CatalogError, LiveDownload};
use crate::playback::streaming::LiveSource;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Body chunks allowed in flight between the network and the reader
const PUMP_DEPTH: usize = 16;
const USER_AGENT: &str = "tuneline/0.1";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

/// Resolved location for downloads that are not direct
#[derive(Debug, Deserialize)]
struct DirectLink {
    url: String,
}

#[derive(Debug, Deserialize)]
struct StationSequenceItem {
    track: Track,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StationTracksResponse {
    sequence: Vec<StationSequenceItem>,
    batch_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackBody {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    track_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_played_seconds: Option<f64>,
}

impl From<StationFeedback> for FeedbackBody {
    fn from(feedback: StationFeedback) -> Self {
        let kind = feedback.kind();
        let (track_id, total_played_seconds) = match feedback {
            StationFeedback::RadioStarted => (None, None),
            StationFeedback::TrackStarted { track_id } => (Some(track_id), None),
            StationFeedback::Skip {
                track_id,
                played_secs,
            }
            | StationFeedback::TrackFinished {
                track_id,
                played_secs,
            } => (Some(track_id), Some(played_secs)),
        };
        Self {
            kind,
            timestamp: chrono::Utc::now(),
            track_id,
            total_played_seconds,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayReportBody {
    track_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    album_id: Option<u64>,
    play_id: String,
    from: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    track_length_seconds: f64,
    total_played_seconds: f64,
}

/// Catalog backed by the HTTP API.
///
/// Every request runs on the runtime handle given at construction, so the
/// client can be driven from the playback thread's own runtime.
pub struct HttpCatalog {
    client: Client,
    base_url: String,
    token: Option<String>,
    runtime: Handle,
    read_timeout: Duration,
}

impl HttpCatalog {
    pub fn new(
        base_url: String,
        token: Option<String>,
        runtime: Handle,
        read_timeout: Duration,
    ) -> Result<Self, CatalogError> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            runtime,
            read_timeout,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("OAuth {}", token)),
            None => request,
        }
    }

    async fn fetch_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, CatalogError> {
        let request = self.authorized(request);
        let body = self
            .runtime
            .spawn(async move {
                let response = check_status(request.send().await?)?;
                Ok::<_, CatalogError>(response.bytes().await?)
            })
            .await??;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get_result<T: DeserializeOwned>(&self, url: String) -> Result<T, CatalogError> {
        let envelope: Envelope<T> = self.fetch_json(self.client.get(url)).await?;
        Ok(envelope.result)
    }

    async fn post_json<B: Serialize>(&self, url: String, body: &B) -> Result<(), CatalogError> {
        let request = self.authorized(self.client.post(url).json(body));
        self.runtime
            .spawn(async move {
                check_status(request.send().await?)?;
                Ok::<_, CatalogError>(())
            })
            .await?
    }
}

fn check_status(response: Response) -> Result<Response, CatalogError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status == 401 || status == 403 {
        Err(CatalogError::Unauthorized)
    } else if status == 404 {
        Err(CatalogError::NotFound)
    } else if status == 429 {
        Err(CatalogError::RateLimit)
    } else {
        Err(CatalogError::Status(status.as_u16()))
    }
}

#[async_trait::async_trait]
impl Catalog for HttpCatalog {
    async fn tracks(&self, ids: &[String]) -> Result<Vec<Track>, CatalogError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/tracks?track-ids={}", self.base_url, ids.join(","));
        let tracks: Vec<Track> = self.get_result(url).await?;
        debug!("Fetched {} of {} tracks", tracks.len(), ids.len());
        Ok(tracks)
    }

    async fn download_info(&self, track_id: &str) -> Result<Vec<DownloadInfo>, CatalogError> {
        let url = format!("{}/tracks/{}/download-info", self.base_url, track_id);
        self.get_result(url).await
    }

    async fn open_stream(&self, info: &DownloadInfo) -> Result<LiveDownload, CatalogError> {
        let media_url = if info.direct {
            info.url.clone()
        } else {
            let link: DirectLink = self.fetch_json(self.client.get(info.url.clone())).await?;
            link.url
        };

        let request = self.client.get(media_url);
        let response = self
            .runtime
            .spawn(async move { check_status(request.send().await?) })
            .await??;

        let total_len = response
            .content_length()
            .ok_or(CatalogError::MissingLength)?;
        info!(
            "Opened {} download at {} kbps: {} bytes",
            info.codec, info.bitrate_kbps, total_len
        );

        let source = HttpSource::spawn(response, &self.runtime, self.read_timeout);
        Ok(LiveDownload {
            source: Box::new(source),
            total_len,
        })
    }

    async fn station_tracks(
        &self,
        station_id: &str,
        last_track_id: Option<&str>,
    ) -> Result<StationBatch, CatalogError> {
        let mut url = format!(
            "{}/rotor/station/{}/tracks?settings2=true",
            self.base_url, station_id
        );
        if let Some(last) = last_track_id {
            url.push_str(&format!("&queue={}", last));
        }

        let response: StationTracksResponse = self.get_result(url).await?;
        Ok(StationBatch {
            batch_id: response.batch_id,
            tracks: response.sequence.into_iter().map(|item| item.track).collect(),
        })
    }

    async fn station_feedback(
        &self,
        station_id: &str,
        batch_id: &str,
        feedback: StationFeedback,
    ) -> Result<(), CatalogError> {
        let url = format!(
            "{}/rotor/station/{}/feedback?batch-id={}",
            self.base_url, station_id, batch_id
        );
        let body = FeedbackBody::from(feedback);
        debug!("Station feedback {} for {}", body.kind, station_id);
        self.post_json(url, &body).await
    }

    async fn report_play(&self, track: &Track) -> Result<(), CatalogError> {
        let url = format!("{}/play-audio", self.base_url);
        let body = PlayReportBody {
            track_id: track.id.clone(),
            album_id: track.albums.first().map(|album| album.id),
            play_id: uuid::Uuid::new_v4().to_string(),
            from: "tuneline",
            timestamp: chrono::Utc::now(),
            track_length_seconds: track.duration_ms as f64 / 1000.0,
            total_played_seconds: 0.0,
        };
        self.post_json(url, &body).await
    }
}

/// Synchronous reader over an HTTP body.
///
/// A task on the catalog runtime pulls body chunks and hands them over a
/// bounded channel; reads wait at most `read_timeout` for the next chunk.
pub struct HttpSource {
    chunks: Option<mpsc::Receiver<Result<Bytes, reqwest::Error>>>,
    pending: Bytes,
    pump: Option<tokio::task::JoinHandle<()>>,
    read_timeout: Duration,
}

impl HttpSource {
    pub fn spawn(mut response: Response, runtime: &Handle, read_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::sync_channel(PUMP_DEPTH);

        let pump = runtime.spawn(async move {
            loop {
                let item = match response.chunk().await {
                    Ok(Some(bytes)) => Ok(bytes),
                    Ok(None) => break,
                    Err(e) => Err(e),
                };
                let failed = item.is_err();

                // Blocking send keeps backpressure on the connection
                let tx = tx.clone();
                match tokio::task::spawn_blocking(move || tx.send(item)).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
                if failed {
                    break;
                }
            }
        });

        Self {
            chunks: Some(rx),
            pending: Bytes::new(),
            pump: Some(pump),
            read_timeout,
        }
    }
}

impl LiveSource for HttpSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            let Some(chunks) = self.chunks.as_ref() else {
                return Err(io::Error::other("HTTP source is closed"));
            };
            match chunks.recv_timeout(self.read_timeout) {
                Ok(Ok(bytes)) => self.pending = bytes,
                Ok(Err(e)) => return Err(io::Error::other(e)),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("No body data within {:?}", self.read_timeout);
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for response body",
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len());
        let head = self.pending.split_to(n);
        buf[..n].copy_from_slice(&head);
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.chunks = None;
        self.pending = Bytes::new();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        Ok(())
    }
}
