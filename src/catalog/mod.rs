mod http;
pub mod models;

use crate::playback::streaming::LiveSource;
use reqwest::Error as ReqwestError;
use thiserror::Error;

pub use http::{HttpCatalog, HttpSource};
pub use models::{
    artist_list, best_download, Album, Artist, DownloadInfo, StationBatch, StationFeedback, Track,
};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] ReqwestError),
    #[error("API rate limit exceeded")]
    RateLimit,
    #[error("Invalid or missing token")]
    Unauthorized,
    #[error("Not found")]
    NotFound,
    #[error("Unexpected status {0}")]
    Status(u16),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Download has no declared length")]
    MissingLength,
    #[error("No download options for track {0}")]
    NoDownloadOptions(String),
    #[error("Request task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A download that has started: the body source and its declared length
pub struct LiveDownload {
    pub source: Box<dyn LiveSource>,
    pub total_len: u64,
}

/// Catalog operations the player needs
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    /// Resolve track ids into descriptors, in the order given
    async fn tracks(&self, ids: &[String]) -> Result<Vec<Track>, CatalogError>;

    async fn download_info(&self, track_id: &str) -> Result<Vec<DownloadInfo>, CatalogError>;

    /// Begin downloading and hand back the live body
    async fn open_stream(&self, info: &DownloadInfo) -> Result<LiveDownload, CatalogError>;

    /// Next batch of tracks for a station, continuing after `last_track_id`
    async fn station_tracks(
        &self,
        station_id: &str,
        last_track_id: Option<&str>,
    ) -> Result<StationBatch, CatalogError>;

    async fn station_feedback(
        &self,
        station_id: &str,
        batch_id: &str,
        feedback: StationFeedback,
    ) -> Result<(), CatalogError>;

    /// Record that a track started playing
    async fn report_play(&self, track: &Track) -> Result<(), CatalogError>;
}
