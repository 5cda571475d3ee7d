//! Chooses which received stream feeds the single remote video surface.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use webrtc::track::track_remote::TrackRemote;

use crate::media::TrackKind;
use crate::signaling::PeerId;

/// Media received from a remote participant.
#[derive(Clone)]
pub struct RemoteStream {
    pub id: String,
    pub track_id: String,
    pub kind: TrackKind,
    pub label: String,
    /// Underlying RTP track. Absent for streams produced by test adapters.
    pub track: Option<Arc<TrackRemote>>,
}

impl RemoteStream {
    pub fn detached(
        id: impl Into<String>,
        track_id: impl Into<String>,
        kind: TrackKind,
        label: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            track_id: track_id.into(),
            kind,
            label: label.into(),
            track: None,
        }
    }

    /// A video track whose label names a screen source.
    pub fn looks_like_screen(&self) -> bool {
        self.kind == TrackKind::Video && self.label.to_ascii_lowercase().contains("screen")
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("attached", &self.track.is_some())
            .finish()
    }
}

impl PartialEq for RemoteStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.track_id == other.track_id
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteStreamRecord {
    pub peer_id: PeerId,
    pub stream: RemoteStream,
    pub is_screen_share: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewSelection {
    #[default]
    RemoteCamera,
    RemoteScreen,
    LocalCamera,
    LocalScreen,
}

impl ViewSelection {
    fn wants_screen(self) -> Option<bool> {
        match self {
            ViewSelection::RemoteCamera => Some(false),
            ViewSelection::RemoteScreen => Some(true),
            ViewSelection::LocalCamera | ViewSelection::LocalScreen => None,
        }
    }

    pub fn is_remote(self) -> bool {
        self.wants_screen().is_some()
    }
}

/// Current selection plus the record bound to the remote surface.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViewState {
    pub selection: ViewSelection,
    pub bound: Option<RemoteStreamRecord>,
}

#[derive(Debug, Default)]
pub struct StreamReconciler {
    // Insertion order doubles as the tie-break between equally good matches.
    records: Vec<RemoteStreamRecord>,
    selection: ViewSelection,
}

impl StreamReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selection(&self) -> ViewSelection {
        self.selection
    }

    pub fn records(&self) -> &[RemoteStreamRecord] {
        &self.records
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&RemoteStreamRecord> {
        self.records.iter().find(|record| record.peer_id == peer_id)
    }

    /// Stores the latest stream for a peer, replacing any previous record in
    /// place. A screen share always promotes the view to `RemoteScreen`.
    pub fn upsert(&mut self, record: RemoteStreamRecord) -> ViewState {
        let promote = record.is_screen_share;
        let peer_id = record.peer_id;
        match self.records.iter_mut().find(|r| r.peer_id == peer_id) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
        if promote && self.selection != ViewSelection::RemoteScreen {
            tracing::info!(
                target = "lesson_room::view",
                peer_id,
                previous = ?self.selection,
                "screen share arrived; promoting remote screen"
            );
            self.selection = ViewSelection::RemoteScreen;
        }
        self.view()
    }

    /// Drops the record for `peer_id`. Returns `None` if there was none.
    pub fn remove(&mut self, peer_id: PeerId) -> Option<ViewState> {
        let index = self.records.iter().position(|r| r.peer_id == peer_id)?;
        self.records.remove(index);
        if self.records.is_empty() && self.selection.is_remote() {
            tracing::debug!(
                target = "lesson_room::view",
                peer_id,
                "last remote stream gone; falling back to local camera"
            );
            self.selection = ViewSelection::LocalCamera;
        }
        Some(self.view())
    }

    pub fn select(&mut self, selection: ViewSelection) -> ViewState {
        self.selection = selection;
        self.view()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.selection = ViewSelection::LocalCamera;
    }

    /// The record for the remote surface: one matching the selection if any,
    /// otherwise the earliest record.
    pub fn bound(&self) -> Option<&RemoteStreamRecord> {
        let preferred = self.selection.wants_screen().and_then(|screen| {
            self.records
                .iter()
                .find(|record| record.is_screen_share == screen)
        });
        preferred.or_else(|| self.records.first())
    }

    pub fn view(&self) -> ViewState {
        ViewState {
            selection: self.selection,
            bound: self.bound().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(peer_id: PeerId) -> RemoteStreamRecord {
        RemoteStreamRecord {
            peer_id,
            stream: RemoteStream::detached(
                format!("stream-{peer_id}"),
                format!("cam-{peer_id}"),
                TrackKind::Video,
                "camera",
            ),
            is_screen_share: false,
        }
    }

    fn screen(peer_id: PeerId) -> RemoteStreamRecord {
        RemoteStreamRecord {
            peer_id,
            stream: RemoteStream::detached(
                format!("screen-stream-{peer_id}"),
                format!("screen-{peer_id}"),
                TrackKind::Video,
                "Screen 1",
            ),
            is_screen_share: true,
        }
    }

    #[test]
    fn screen_share_promotes_regardless_of_selection() {
        for prior in [
            ViewSelection::RemoteCamera,
            ViewSelection::LocalCamera,
            ViewSelection::LocalScreen,
        ] {
            let mut view = StreamReconciler::new();
            view.select(prior);
            view.upsert(camera(1));
            let state = view.upsert(screen(2));
            assert_eq!(state.selection, ViewSelection::RemoteScreen);
            assert_eq!(state.bound.unwrap().peer_id, 2);
        }
    }

    #[test]
    fn selection_falls_back_to_any_stream() {
        let mut view = StreamReconciler::new();
        view.upsert(camera(1));
        let state = view.select(ViewSelection::RemoteScreen);
        assert_eq!(state.bound, Some(camera(1)));
    }

    #[test]
    fn removing_last_stream_resets_to_local_camera() {
        let mut view = StreamReconciler::new();
        view.upsert(camera(1));
        view.select(ViewSelection::RemoteScreen);
        let state = view.remove(1).unwrap();
        assert_eq!(state.selection, ViewSelection::LocalCamera);
        assert!(state.bound.is_none());
        assert!(view.remove(1).is_none());
    }

    #[test]
    fn removal_rebinds_to_remaining_records() {
        let mut view = StreamReconciler::new();
        view.upsert(camera(1));
        view.upsert(screen(2));
        let state = view.remove(2).unwrap();
        assert_eq!(state.selection, ViewSelection::RemoteScreen);
        assert_eq!(state.bound.unwrap().peer_id, 1);
    }

    #[test]
    fn replacement_keeps_one_record_per_peer() {
        let mut view = StreamReconciler::new();
        view.upsert(camera(7));
        view.upsert(camera(8));
        let state = view.upsert(screen(7));
        assert_eq!(view.records().len(), 2);
        assert_eq!(view.records()[0].peer_id, 7);
        assert!(view.records()[0].is_screen_share);
        assert_eq!(state.bound.unwrap().peer_id, 7);
    }

    #[test]
    fn simultaneous_screen_shares_bind_first_inserted() {
        let mut view = StreamReconciler::new();
        view.upsert(screen(3));
        view.upsert(screen(4));
        assert_eq!(view.bound().unwrap().peer_id, 3);
    }

    #[test]
    fn screen_label_classification() {
        assert!(
            RemoteStream::detached("s", "t", TrackKind::Video, "Entire SCREEN").looks_like_screen()
        );
        assert!(!RemoteStream::detached("s", "t", TrackKind::Audio, "screen").looks_like_screen());
        assert!(!RemoteStream::detached("s", "t", TrackKind::Video, "camera").looks_like_screen());
    }
}
