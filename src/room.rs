//! Naming and schema of room documents kept in the shared container.
//!
//! The constants used here are the wire format shared with every other peer using the same
//! container, so they must not change.

use crate::store::{FileContent, NewContainer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Room used when the caller doesn't name one.
pub const DEFAULT_ROOM_ID: &str = "default_room";

/// Description marking the container which holds room documents.
pub const CONTAINER_TAG: &str = "__pist_repo__";

const ROOM_PREFIX: &str = "__pist_room__:";

/// Locally gathered transport candidate, in its JSON (browser compatible) form.
pub type Candidate = RTCIceCandidateInit;

/// Name of the file holding the room document of a given room.
pub fn room_name(room_id: &str) -> String {
    format!("{ROOM_PREFIX}{room_id}")
}

/// Reverse of [room_name]. Returns `None` for files which are not room documents.
pub fn room_id(file_name: &str) -> Option<&str> {
    file_name.strip_prefix(ROOM_PREFIX)
}

pub fn is_room_file(file_name: &str) -> bool {
    file_name.starts_with(ROOM_PREFIX)
}

pub fn container_tag() -> &'static str {
    CONTAINER_TAG
}

/// Checks if the container description marks it as ours.
pub fn is_container(description: Option<&str>) -> bool {
    description == Some(container_tag())
}

/// Payload used to create the shared container: a single, empty room document.
pub fn default_container_payload(room_id: &str) -> NewContainer {
    let mut files = BTreeMap::new();
    files.insert(room_name(room_id), FileContent::new("{}"));
    NewContainer {
        description: CONTAINER_TAG.to_owned(),
        files,
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as exchanged through the room document (`{"type": .., "sdp": ..}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RoomStatus {
    /// Nobody has published an offer yet.
    Unclaimed,
    AwaitingAnswer,
    /// Both offer and answer are present for the current round.
    Complete,
}

/// Signaling document of a single room.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Room {
    #[serde(default)]
    pub name: String,
    /// Candidates published by each negotiation session, keyed by session id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice: Option<BTreeMap<String, Vec<Candidate>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl Room {
    /// Room with nothing published in it yet.
    pub fn empty(room_id: &str) -> Self {
        Room {
            name: room_name(room_id),
            ..Default::default()
        }
    }

    pub fn status(&self) -> RoomStatus {
        match (&self.offer, &self.answer) {
            (None, _) => RoomStatus::Unclaimed,
            (Some(_), None) => RoomStatus::AwaitingAnswer,
            (Some(_), Some(_)) => RoomStatus::Complete,
        }
    }

    pub fn decode(name: String, bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let mut room: Room = serde_json::from_slice(bytes)?;
        room.name = name;
        Ok(room)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Adds `ice` entries of a previously stored version of this room. Entries already present
    /// in `self` take precedence, entries of other sessions are kept as they were.
    pub fn merge_ice(&mut self, prior: &Room) {
        if let Some(prior) = &prior.ice {
            let ice = self.ice.get_or_insert_with(BTreeMap::new);
            for (session_id, candidates) in prior {
                ice.entry(session_id.clone())
                    .or_insert_with(|| candidates.clone());
            }
        }
    }

    /// Candidates published by every session other than `session_id`.
    pub fn remote_candidates(&self, session_id: &str) -> Vec<Candidate> {
        match &self.ice {
            None => Vec::new(),
            Some(ice) => ice
                .iter()
                .filter(|(id, _)| id.as_str() != session_id)
                .flat_map(|(_, candidates)| candidates.iter().cloned())
                .collect(),
        }
    }
}
