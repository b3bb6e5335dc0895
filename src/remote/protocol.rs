//! JSON messages exchanged with the remote playback session.
//!
//! Integer fields may arrive either as numbers or as decimal strings.

use serde::{Deserialize, Deserializer, Serialize};

fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Float(f64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(v) => Ok(v),
        IntOrString::Float(v) => Ok(v as i64),
        IntOrString::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Playable {
    pub playable_id: String,
    #[serde(default)]
    pub playable_type: String,
    #[serde(default)]
    pub from: String,
}

impl Playable {
    pub fn track(id: &str) -> Self {
        Self {
            playable_id: id.to_string(),
            playable_type: "TRACK".to_string(),
            from: "tuneline".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueOptions {
    #[serde(default)]
    pub repeat_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerQueue {
    #[serde(default = "no_index", deserialize_with = "de_i64")]
    pub current_playable_index: i64,
    #[serde(default)]
    pub playable_list: Vec<Playable>,
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub options: QueueOptions,
}

fn no_index() -> i64 {
    -1
}

impl Default for PlayerQueue {
    fn default() -> Self {
        Self {
            current_playable_index: no_index(),
            playable_list: Vec::new(),
            entity_id: String::new(),
            entity_type: "VARIOUS".to_string(),
            options: QueueOptions {
                repeat_mode: "NONE".to_string(),
            },
        }
    }
}

/// Transport status: what every device reports about playback progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayingStatus {
    #[serde(default, deserialize_with = "de_i64")]
    pub progress_ms: i64,
    #[serde(default, deserialize_with = "de_i64")]
    pub duration_ms: i64,
    #[serde(default)]
    pub paused: bool,
    #[serde(default = "normal_speed")]
    pub playback_speed: f64,
}

fn normal_speed() -> f64 {
    1.0
}

impl Default for PlayingStatus {
    fn default() -> Self {
        Self {
            progress_ms: 0,
            duration_ms: 0,
            paused: true,
            playback_speed: normal_speed(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerState {
    #[serde(default)]
    pub player_queue: PlayerQueue,
    #[serde(default)]
    pub status: PlayingStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    pub device_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub app_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceVolume {
    #[serde(default)]
    pub volume: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceCapabilities {
    #[serde(default)]
    pub can_be_player: bool,
    #[serde(default)]
    pub can_be_remote_controller: bool,
    #[serde(default)]
    pub volume_granularity: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub info: DeviceInfo,
    #[serde(default)]
    pub volume_info: DeviceVolume,
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
}

/// Full-state snapshot pushed by the remote session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PutStateResponse {
    #[serde(default)]
    pub player_state: PlayerState,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub active_device_id_optional: Option<String>,
}

impl PutStateResponse {
    pub fn track_ids(&self) -> Vec<String> {
        self.player_state
            .player_queue
            .playable_list
            .iter()
            .map(|p| p.playable_id.clone())
            .collect()
    }

    /// Index of the current playable when it points into the list
    pub fn current_index(&self) -> Option<usize> {
        let queue = &self.player_state.player_queue;
        usize::try_from(queue.current_playable_index)
            .ok()
            .filter(|&i| i < queue.playable_list.len())
    }

    pub fn current_playable_id(&self) -> Option<&str> {
        self.current_index().map(|i| {
            self.player_state.player_queue.playable_list[i]
                .playable_id
                .as_str()
        })
    }

    pub fn device_volume(&self, device_id: &str) -> Option<f64> {
        self.devices
            .iter()
            .find(|d| d.info.device_id == device_id)
            .map(|d| d.volume_info.volume)
    }
}

/// This device as announced to the session
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpdateDevice {
    pub info: DeviceInfo,
    pub volume_info: DeviceVolume,
    pub capabilities: DeviceCapabilities,
}

/// Outbound state changes
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PutStateRequest {
    UpdateFullState {
        player_state: PlayerState,
        device: UpdateDevice,
        is_currently_active: bool,
    },
    UpdatePlayingStatus {
        playing_status: PlayingStatus,
    },
    UpdatePlayerState {
        player_state: PlayerState,
    },
}

impl PutStateRequest {
    /// Handshake announcing an idle, paused player
    pub fn initial(device_id: &str, device_name: &str, volume: f64, volume_step: f64) -> Self {
        let granularity = if volume_step > 0.0 {
            (1.0 / volume_step).round() as u32
        } else {
            1
        };
        PutStateRequest::UpdateFullState {
            player_state: PlayerState::default(),
            device: UpdateDevice {
                info: DeviceInfo {
                    device_id: device_id.to_string(),
                    title: device_name.to_string(),
                    device_type: "WEB".to_string(),
                    app_name: "tuneline".to_string(),
                },
                volume_info: DeviceVolume { volume },
                capabilities: DeviceCapabilities {
                    can_be_player: true,
                    can_be_remote_controller: false,
                    volume_granularity: granularity,
                },
            },
            is_currently_active: false,
        }
    }

    /// Wrap with a request id and timestamp for sending
    pub fn into_message(self) -> PutStateMessage {
        PutStateMessage {
            request: self,
            rid: uuid::Uuid::new_v4().to_string(),
            player_action_timestamp_ms: chrono::Utc::now().timestamp_millis(),
            activity_interception_type: "DO_NOT_INTERCEPT_BY_DEFAULT",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PutStateMessage {
    #[serde(flatten)]
    pub request: PutStateRequest,
    pub rid: String,
    pub player_action_timestamp_ms: i64,
    pub activity_interception_type: &'static str,
}
