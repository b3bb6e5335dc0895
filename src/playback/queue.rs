use crate::catalog::Track;
use rand::seq::SliceRandom;

/// Where the queue's tracks come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueKind {
    /// A fixed list of tracks
    Finite,
    /// An endless station, topped up batch by batch
    Station { station_id: String, batch_id: String },
    /// Mirrors the queue of the remote session
    Remote,
}

/// Outcome of moving to the next track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Moved,
    /// Finite queue ran out; the cursor went back to the first track
    End,
    Empty,
}

#[derive(Debug, Clone)]
pub struct Queue {
    kind: QueueKind,
    tracks: Vec<Track>,
    current: usize,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new(QueueKind::Finite, Vec::new(), 0)
    }
}

impl Queue {
    pub fn new(kind: QueueKind, tracks: Vec<Track>, current: usize) -> Self {
        let current = current.min(tracks.len().saturating_sub(1));
        Self {
            kind,
            tracks,
            current,
        }
    }

    pub fn kind(&self) -> &QueueKind {
        &self.kind
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn index(&self) -> usize {
        self.current
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.tracks.get(self.current)
    }

    pub fn is_station(&self) -> bool {
        matches!(self.kind, QueueKind::Station { .. })
    }

    pub fn is_remote(&self) -> bool {
        self.kind == QueueKind::Remote
    }

    /// Station queues want the next batch once the cursor is within two of the end
    pub fn needs_more(&self) -> bool {
        self.is_station() && self.current + 2 >= self.tracks.len()
    }

    /// Append a station batch and remember its id for feedback
    pub fn extend_station(&mut self, batch_id: String, tracks: Vec<Track>) {
        if let QueueKind::Station {
            batch_id: current, ..
        } = &mut self.kind
        {
            *current = batch_id;
        }
        self.tracks.extend(tracks);
    }

    pub fn advance(&mut self) -> Advance {
        if self.tracks.is_empty() {
            return Advance::Empty;
        }
        if !self.is_station() && self.current + 1 >= self.tracks.len() {
            self.current = 0;
            return Advance::End;
        }
        if self.current + 1 >= self.tracks.len() {
            // Station without a fresh batch; stay on the last track
            return Advance::End;
        }
        self.current += 1;
        Advance::Moved
    }

    /// Step back one track. False at the start of the queue.
    pub fn retreat(&mut self) -> bool {
        if self.current == 0 {
            return false;
        }
        self.current -= 1;
        true
    }

    pub fn select(&mut self, index: usize) -> bool {
        if index >= self.tracks.len() {
            return false;
        }
        self.current = index;
        true
    }

    /// Shuffle the tracks, keeping the current one selected.
    /// Station queues cannot be shuffled.
    pub fn shuffle(&mut self) -> bool {
        if self.is_station() || self.tracks.len() < 2 {
            return false;
        }
        let current_id = self.tracks[self.current].id.clone();
        self.tracks.shuffle(&mut rand::thread_rng());
        if let Some(index) = self.tracks.iter().position(|t| t.id == current_id) {
            self.current = index;
        }
        true
    }
}
