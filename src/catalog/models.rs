use serde::{Deserialize, Serialize};

/// Artist credit on a track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artist {
    pub id: u64,
    pub name: String,
}

/// Album a track appears on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Album {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub year: Option<u32>,
}

/// Track descriptor as returned by the catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub artists: Vec<Artist>,
    #[serde(default)]
    pub albums: Vec<Album>,
}

fn default_available() -> bool {
    true
}

impl Track {
    /// Title with the version suffix, e.g. "Song (Live)"
    pub fn display_title(&self) -> String {
        match self.version.as_deref() {
            Some(version) if !version.is_empty() => format!("{} ({})", self.title, version),
            _ => self.title.clone(),
        }
    }
}

/// One way of downloading a track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadInfo {
    pub codec: String,
    #[serde(rename = "bitrateInKbps")]
    pub bitrate_kbps: u32,
    #[serde(rename = "downloadInfoUrl")]
    pub url: String,
    #[serde(default)]
    pub direct: bool,
}

/// Next batch of tracks for an infinite station
#[derive(Debug, Clone, PartialEq)]
pub struct StationBatch {
    pub batch_id: String,
    pub tracks: Vec<Track>,
}

/// Listening feedback sent to a station so it can shape the next batch
#[derive(Debug, Clone, PartialEq)]
pub enum StationFeedback {
    RadioStarted,
    TrackStarted { track_id: String },
    Skip { track_id: String, played_secs: f64 },
    TrackFinished { track_id: String, played_secs: f64 },
}

impl StationFeedback {
    pub fn kind(&self) -> &'static str {
        match self {
            StationFeedback::RadioStarted => "radioStarted",
            StationFeedback::TrackStarted { .. } => "trackStarted",
            StationFeedback::Skip { .. } => "skip",
            StationFeedback::TrackFinished { .. } => "trackFinished",
        }
    }
}

/// Pick the download with the highest bitrate
pub fn best_download(infos: &[DownloadInfo]) -> Option<&DownloadInfo> {
    infos.iter().max_by_key(|info| info.bitrate_kbps)
}

/// Artist names joined with ", "
pub fn artist_list(artists: &[Artist]) -> String {
    artists
        .iter()
        .map(|artist| artist.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(bitrate_kbps: u32) -> DownloadInfo {
        DownloadInfo {
            codec: "mp3".to_string(),
            bitrate_kbps,
            url: format!("https://example.invalid/{}", bitrate_kbps),
            direct: false,
        }
    }

    #[test]
    fn test_best_download_prefers_highest_bitrate() {
        let infos = vec![info(128), info(320), info(192)];
        assert_eq!(best_download(&infos).map(|i| i.bitrate_kbps), Some(320));
        assert!(best_download(&[]).is_none());
    }

    #[test]
    fn test_artist_list() {
        let artists = vec![
            Artist {
                id: 1,
                name: "First".to_string(),
            },
            Artist {
                id: 2,
                name: "Second".to_string(),
            },
        ];
        assert_eq!(artist_list(&artists), "First, Second");
        assert_eq!(artist_list(&[]), "");
    }

    #[test]
    fn test_track_parses_catalog_json() {
        let json = r#"{
            "id": "12345",
            "title": "Song",
            "version": "Live",
            "durationMs": 215000,
            "artists": [{"id": 7, "name": "Band", "various": false}],
            "albums": [{"id": 9, "title": "Record", "year": 2001}],
            "coverUri": "ignored"
        }"#;

        let track: Track = serde_json::from_str(json).unwrap();
        assert_eq!(track.id, "12345");
        assert_eq!(track.duration_ms, 215_000);
        assert!(track.available);
        assert_eq!(track.display_title(), "Song (Live)");
        assert_eq!(track.albums[0].year, Some(2001));
    }

    #[test]
    fn test_download_info_parses_catalog_json() {
        let json = r#"{"codec":"mp3","bitrateInKbps":320,"downloadInfoUrl":"https://x/y","direct":false,"gain":false}"#;
        let parsed: DownloadInfo = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.bitrate_kbps, 320);
        assert_eq!(parsed.url, "https://x/y");
    }
}
