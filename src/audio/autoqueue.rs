use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::{audio::track::Track, lavalink::NodePool};

/// Picks something to play when a queue runs dry with `auto_queue` on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackRecommender: Send + Sync + 'static {
    /// A track related to `seed`, avoiding the identifiers in `recent`.
    async fn recommend(&self, seed: &Track, recent: &[String]) -> Option<Track>;
}

/// Recommends from the YouTube "Mix" playlist (`list=RD<id>`) of the
/// seed track, resolved through the node pool.
#[derive(Clone)]
pub struct YouTubeMixRecommender {
    pool: NodePool,
}

impl YouTubeMixRecommender {
    pub fn new(pool: NodePool) -> Self {
        Self { pool }
    }

    /// Extrae el ID de video de una URL de YouTube
    pub fn video_id(track: &Track) -> Option<String> {
        if track.source_name.as_deref() == Some("youtube") && track.identifier.len() == 11 {
            return Some(track.identifier.clone());
        }

        let regex = Regex::new(
            r"(?:youtube\.com/watch\?v=|youtu\.be/|youtube\.com/embed/|music\.youtube\.com/watch\?v=)([a-zA-Z0-9_-]{11})",
        )
        .ok()?;
        let uri = track.uri.as_deref()?;
        regex
            .captures(uri)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[async_trait]
impl TrackRecommender for YouTubeMixRecommender {
    async fn recommend(&self, seed: &Track, recent: &[String]) -> Option<Track> {
        let Some(id) = Self::video_id(seed) else {
            debug!("🤖 Sin recomendación: {} no es de YouTube", seed.title);
            return None;
        };

        let url = format!("https://www.youtube.com/watch?v={}&list=RD{}", id, id);
        let tracks = match self.pool.load_tracks(&url, seed.requester).await {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!("🤖 No se pudo cargar el mix de {}: {}", seed.title, e);
                return None;
            }
        };

        tracks
            .into_iter()
            .find(|t| t.identifier != seed.identifier && !recent.contains(&t.identifier))
    }
}
