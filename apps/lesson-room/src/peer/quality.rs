use serde::{Deserialize, Serialize};

use super::connection::PeerState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Good,
    Fair,
    Poor,
}

/// Folds every peer state into one quality signal. A lost peer dominates a
/// negotiating one; `None` means there is no live connection to judge.
pub fn aggregate(states: impl IntoIterator<Item = PeerState>) -> Option<ConnectionQuality> {
    let mut negotiating = false;
    let mut connected = false;
    for state in states {
        match state {
            PeerState::Failed | PeerState::Disconnected => return Some(ConnectionQuality::Poor),
            PeerState::New | PeerState::Connecting => negotiating = true,
            PeerState::Connected => connected = true,
            PeerState::Closed => {}
        }
    }
    if negotiating {
        Some(ConnectionQuality::Fair)
    } else if connected {
        Some(ConnectionQuality::Good)
    } else {
        None
    }
}
