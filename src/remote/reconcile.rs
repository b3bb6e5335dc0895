use crate::remote::protocol::PutStateResponse;

/// Position drift tolerated before the remote position is applied locally
pub const DRIFT_TOLERANCE_MS: i64 = 5_000;

/// What the control loop knows about local playback when a snapshot arrives
#[derive(Debug, Clone, Default)]
pub struct LocalView<'a> {
    /// Id of the last started track
    pub playing_track_id: Option<&'a str>,
    pub position_ms: i64,
    pub volume: f64,
    /// Track count of the remote-linked queue, if that queue is active
    pub known_track_count: Option<usize>,
}

/// Queue the snapshot describes
#[derive(Debug, Clone, PartialEq)]
pub struct QueueUpdate {
    pub track_ids: Vec<String>,
    pub current: usize,
    /// Track metadata must be fetched again because the list changed size
    pub refetch: bool,
}

/// Corrections to apply locally, in order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub queue: Option<QueueUpdate>,
    pub switch_track: bool,
    pub seek_delta_ms: Option<i64>,
    pub paused: Option<bool>,
    pub volume: Option<f64>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        *self == ReconcilePlan::default()
    }
}

/// Decides which parts of an inbound snapshot win over local state
#[derive(Debug, Clone)]
pub struct Reconciler {
    device_id: String,
    drift_tolerance_ms: i64,
}

impl Reconciler {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            drift_tolerance_ms: DRIFT_TOLERANCE_MS,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Plan local corrections for `snapshot`.
    /// Returns None when another device is active; nothing should change then.
    pub fn plan(&self, snapshot: &PutStateResponse, local: &LocalView<'_>) -> Option<ReconcilePlan> {
        if snapshot.active_device_id_optional.as_deref() != Some(self.device_id.as_str()) {
            return None;
        }

        let mut plan = ReconcilePlan::default();

        let track_ids = snapshot.track_ids();
        let current = snapshot.current_index();
        if let Some(current) = current {
            let refetch = local.known_track_count != Some(track_ids.len());
            plan.queue = Some(QueueUpdate {
                track_ids,
                current,
                refetch,
            });
        }

        plan.switch_track = match snapshot.current_playable_id() {
            Some(id) => local.playing_track_id != Some(id),
            None => false,
        };

        // A switched track starts from zero
        let local_position = if plan.switch_track {
            0
        } else {
            local.position_ms
        };
        let status = &snapshot.player_state.status;
        let diff = status.progress_ms - local_position;
        if current.is_some() && diff.abs() > self.drift_tolerance_ms {
            plan.seek_delta_ms = Some(diff);
        }

        plan.paused = Some(status.paused);

        if let Some(volume) = snapshot.device_volume(&self.device_id) {
            if (volume - local.volume).abs() > f64::EPSILON {
                plan.volume = Some(volume);
            }
        }

        Some(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::protocol::{Device, DeviceInfo, DeviceVolume, Playable};

    fn snapshot(active: &str, ids: &[&str], current: i64, progress_ms: i64) -> PutStateResponse {
        let mut snapshot = PutStateResponse::default();
        snapshot.active_device_id_optional = Some(active.to_string());
        snapshot.player_state.player_queue.playable_list =
            ids.iter().map(|id| Playable::track(id)).collect();
        snapshot.player_state.player_queue.current_playable_index = current;
        snapshot.player_state.status.progress_ms = progress_ms;
        snapshot.player_state.status.paused = false;
        snapshot
    }

    fn view(track: &str, position_ms: i64) -> LocalView<'_> {
        LocalView {
            playing_track_id: Some(track),
            position_ms,
            volume: 0.5,
            known_track_count: Some(2),
        }
    }

    #[test]
    fn test_other_active_device_is_ignored() {
        let reconciler = Reconciler::new("me");
        let snap = snapshot("someone-else", &["a", "b"], 1, 90_000);
        assert_eq!(reconciler.plan(&snap, &view("a", 0)), None);
    }

    #[test]
    fn test_drift_beyond_tolerance_seeks() {
        let reconciler = Reconciler::new("me");
        let snap = snapshot("me", &["a", "b"], 0, 50_000);
        let plan = reconciler.plan(&snap, &view("a", 44_000)).unwrap();

        assert!(!plan.switch_track);
        assert_eq!(plan.seek_delta_ms, Some(6_000));
        assert_eq!(plan.paused, Some(false));
    }

    #[test]
    fn test_drift_within_tolerance_is_left_alone() {
        let reconciler = Reconciler::new("me");
        let snap = snapshot("me", &["a", "b"], 0, 48_000);
        let plan = reconciler.plan(&snap, &view("a", 44_000)).unwrap();
        assert_eq!(plan.seek_delta_ms, None);

        let snap = snapshot("me", &["a", "b"], 0, 39_000);
        let plan = reconciler.plan(&snap, &view("a", 44_000)).unwrap();
        assert_eq!(plan.seek_delta_ms, None);
    }

    #[test]
    fn test_different_track_switches_and_seeks_from_zero() {
        let reconciler = Reconciler::new("me");
        let snap = snapshot("me", &["a", "b"], 1, 30_000);
        let plan = reconciler.plan(&snap, &view("a", 29_000)).unwrap();

        assert!(plan.switch_track);
        assert_eq!(plan.seek_delta_ms, Some(30_000));
        assert_eq!(
            plan.queue,
            Some(QueueUpdate {
                track_ids: vec!["a".to_string(), "b".to_string()],
                current: 1,
                refetch: false,
            })
        );
    }

    #[test]
    fn test_changed_list_size_refetches() {
        let reconciler = Reconciler::new("me");
        let snap = snapshot("me", &["a", "b", "c"], 0, 0);
        let plan = reconciler.plan(&snap, &view("a", 0)).unwrap();
        assert!(plan.queue.unwrap().refetch);

        let mut local = view("a", 0);
        local.known_track_count = None;
        let snap = snapshot("me", &["a", "b"], 0, 0);
        assert!(reconciler.plan(&snap, &local).unwrap().queue.unwrap().refetch);
    }

    #[test]
    fn test_device_volume_applies_when_different() {
        let reconciler = Reconciler::new("me");
        let mut snap = snapshot("me", &["a", "b"], 0, 0);
        snap.devices.push(Device {
            info: DeviceInfo {
                device_id: "me".to_string(),
                ..Default::default()
            },
            volume_info: DeviceVolume { volume: 0.8 },
            capabilities: Default::default(),
        });

        let plan = reconciler.plan(&snap, &view("a", 0)).unwrap();
        assert_eq!(plan.volume, Some(0.8));

        let mut local = view("a", 0);
        local.volume = 0.8;
        assert_eq!(reconciler.plan(&snap, &local).unwrap().volume, None);
    }

    #[test]
    fn test_empty_queue_only_applies_transport() {
        let reconciler = Reconciler::new("me");
        let mut snap = snapshot("me", &[], -1, 20_000);
        snap.player_state.status.paused = true;
        let plan = reconciler.plan(&snap, &view("a", 0)).unwrap();

        assert_eq!(plan.queue, None);
        assert!(!plan.switch_track);
        assert_eq!(plan.seek_delta_ms, None);
        assert_eq!(plan.paused, Some(true));
    }
}
