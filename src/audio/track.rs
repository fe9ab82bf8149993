use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::time::Duration;

/// Representa un track resuelto por un nodo
///
/// `encoded` is the opaque handle the node needs to play the track; the
/// rest is metadata for display and history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub encoded: String,
    pub identifier: String,
    pub title: String,
    pub author: Option<String>,
    pub uri: Option<String>,
    pub length: Duration,
    pub is_stream: bool,
    pub source_name: Option<String>,
    pub requester: UserId,
    pub added_at: DateTime<Utc>,
}

impl Track {
    pub fn new(
        encoded: impl Into<String>,
        identifier: impl Into<String>,
        title: impl Into<String>,
        length: Duration,
        requester: UserId,
    ) -> Self {
        Self {
            encoded: encoded.into(),
            identifier: identifier.into(),
            title: title.into(),
            author: None,
            uri: None,
            length,
            is_stream: false,
            source_name: None,
            requester,
            added_at: Utc::now(),
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_source(mut self, source_name: impl Into<String>) -> Self {
        self.source_name = Some(source_name.into());
        self
    }

    pub fn as_stream(mut self) -> Self {
        self.is_stream = true;
        self
    }

    /// Same track requested by someone else (autoqueue, playlists).
    pub fn requested_by(mut self, requester: UserId) -> Self {
        self.requester = requester;
        self.added_at = Utc::now();
        self
    }

    /// Whether a node-side event refers to this track.
    pub fn matches(&self, encoded: &str) -> bool {
        self.encoded == encoded
    }
}

/// A track paired with where playback stood, used to resume on another
/// node or after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub track: Track,
    pub position: Duration,
    pub paused: bool,
    pub upcoming: Vec<Track>,
}
