//! Lavalink v3 REST: `GET /loadtracks`.

use reqwest::Client;
use serde::Deserialize;
use serenity::model::id::UserId;
use std::time::Duration;
use tracing::debug;

use crate::{
    audio::track::Track,
    config::NodeDescriptor,
    error::{MusicError, MusicResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadType {
    TrackLoaded,
    PlaylistLoaded,
    SearchResult,
    NoMatches,
    LoadFailed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub load_type: LoadType,
    #[serde(default)]
    pub playlist_info: Option<PlaylistInfo>,
    #[serde(default)]
    pub tracks: Vec<RemoteTrack>,
    #[serde(default)]
    pub exception: Option<LoadException>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub selected_track: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadException {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTrack {
    pub track: String,
    pub info: RemoteTrackInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTrackInfo {
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    /// Milisegundos
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub is_stream: bool,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
}

impl RemoteTrack {
    pub fn into_track(self, requester: UserId) -> Track {
        let info = self.info;
        let mut track = Track::new(
            self.track,
            info.identifier,
            info.title,
            Duration::from_millis(info.length),
            requester,
        );
        if let Some(author) = info.author {
            track = track.with_author(author);
        }
        if let Some(uri) = info.uri {
            track = track.with_uri(uri);
        }
        if let Some(source) = info.source_name {
            track = track.with_source(source);
        }
        if info.is_stream {
            track = track.as_stream();
        }
        track
    }
}

impl LoadResult {
    /// Tracks to enqueue for this result.
    ///
    /// A search yields only its best match; a playlist yields every track.
    pub fn into_tracks(self, query: &str, requester: UserId) -> MusicResult<Vec<Track>> {
        let failed = |message: String| MusicError::LoadFailed {
            query: query.to_string(),
            message,
        };

        match self.load_type {
            LoadType::TrackLoaded | LoadType::SearchResult => self
                .tracks
                .into_iter()
                .next()
                .map(|t| vec![t.into_track(requester)])
                .ok_or_else(|| failed("sin resultados".to_string())),
            LoadType::PlaylistLoaded => {
                if let Some(name) = self.playlist_info.and_then(|p| p.name) {
                    debug!("📃 Playlist '{}' con {} tracks", name, self.tracks.len());
                }
                if self.tracks.is_empty() {
                    return Err(failed("playlist vacía".to_string()));
                }
                Ok(self
                    .tracks
                    .into_iter()
                    .map(|t| t.into_track(requester))
                    .collect())
            }
            LoadType::NoMatches => Err(failed("sin resultados".to_string())),
            LoadType::LoadFailed => Err(failed(
                self.exception
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "error desconocido".to_string()),
            )),
        }
    }
}

/// Queries with a scheme are loaded as-is; anything else is a YouTube
/// search.
pub fn search_identifier(query: &str) -> String {
    let query = query.trim();
    if query.starts_with("http://") || query.starts_with("https://") || query.contains("search:") {
        query.to_string()
    } else {
        format!("ytsearch:{}", query)
    }
}

/// HTTP client shared by every node.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: Client,
}

impl RestClient {
    pub fn new(timeout: Duration) -> MusicResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("helix-music/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MusicError::Transport {
                node: "rest".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { http })
    }

    pub async fn load_tracks(
        &self,
        node: &NodeDescriptor,
        identifier: &str,
    ) -> MusicResult<LoadResult> {
        let transport = |e: &dyn std::fmt::Display| MusicError::Transport {
            node: node.identifier.clone(),
            message: e.to_string(),
        };

        let path = format!("/loadtracks?identifier={}", urlencoding::encode(identifier));
        let url = node.http_url(&path).map_err(|e| transport(&e))?;

        debug!("🔍 [{}] loadtracks {}", node.identifier, identifier);
        let response = self
            .http
            .get(url)
            .header("Authorization", &node.password)
            .send()
            .await
            .map_err(|e| transport(&e))?
            .error_for_status()
            .map_err(|e| transport(&e))?;

        response.json::<LoadResult>().await.map_err(|e| transport(&e))
    }
}
