use serenity::model::id::GuildId;
use std::fmt;

use crate::audio::track::Track;

/// User-facing notification produced by a session.
///
/// Plain data; rendering (embeds, buttons) belongs to the presentation
/// layer.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    NowPlaying {
        guild_id: GuildId,
        track: Track,
    },
    QueueEmpty {
        guild_id: GuildId,
    },
    TrackFailed {
        guild_id: GuildId,
        title: String,
        cause: String,
    },
    /// A node failed without affecting playback yet.
    NodeFailure {
        guild_id: GuildId,
        node: String,
    },
    /// Playback was cut off; `to` is the node it resumed on, if any.
    PlaybackInterrupted {
        guild_id: GuildId,
        from: String,
        to: Option<String>,
    },
    AutoPaused {
        guild_id: GuildId,
    },
    AutoResumed {
        guild_id: GuildId,
    },
    Left {
        guild_id: GuildId,
    },
}

impl StatusUpdate {
    pub fn guild_id(&self) -> GuildId {
        match self {
            StatusUpdate::NowPlaying { guild_id, .. }
            | StatusUpdate::QueueEmpty { guild_id }
            | StatusUpdate::TrackFailed { guild_id, .. }
            | StatusUpdate::NodeFailure { guild_id, .. }
            | StatusUpdate::PlaybackInterrupted { guild_id, .. }
            | StatusUpdate::AutoPaused { guild_id }
            | StatusUpdate::AutoResumed { guild_id }
            | StatusUpdate::Left { guild_id } => *guild_id,
        }
    }
}

impl fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusUpdate::NowPlaying { track, .. } => {
                write!(f, "🎵 Reproduciendo: {}", track.title)?;
                if let Some(author) = &track.author {
                    write!(f, " - {}", author)?;
                }
                Ok(())
            }
            StatusUpdate::QueueEmpty { .. } => write!(f, "📭 La cola está vacía"),
            StatusUpdate::TrackFailed { title, cause, .. } => {
                write!(f, "⚠️ No se pudo reproducir {}: {}", title, cause)
            }
            StatusUpdate::NodeFailure { node, .. } => {
                write!(f, "⚠️ Problemas con el servidor de audio {}", node)
            }
            StatusUpdate::PlaybackInterrupted { from, to: Some(to), .. } => write!(
                f,
                "🔀 Reproducción interrumpida en {}, continuando en {}",
                from, to
            ),
            StatusUpdate::PlaybackInterrupted { from, to: None, .. } => write!(
                f,
                "❌ Reproducción interrumpida: el servidor {} no está disponible",
                from
            ),
            StatusUpdate::AutoPaused { .. } => {
                write!(f, "⏸️ Pausado: no queda nadie en el canal")
            }
            StatusUpdate::AutoResumed { .. } => write!(f, "▶️ Reanudado"),
            StatusUpdate::Left { .. } => write!(f, "👋 Desconectado del canal de voz"),
        }
    }
}
