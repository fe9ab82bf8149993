use serenity::model::id::GuildId;
use thiserror::Error;

/// Errores del núcleo de reproducción.
///
/// Only `NoAvailableNode`, `PlaybackInterrupted` and the user-input variants
/// are meant to reach a user; the rest are recovered locally (reconnect,
/// skip, migrate) and logged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MusicError {
    /// Command sent to a node that is not Ready.
    #[error("el nodo {node} no está listo")]
    NotReady { node: String },

    /// Every configured node is unavailable.
    #[error("no hay nodos de audio disponibles")]
    NoAvailableNode,

    /// A session lost its node mid-track.
    #[error("reproducción interrumpida en guild {guild_id}: {reason}")]
    PlaybackInterrupted { guild_id: GuildId, reason: String },

    /// A single track failed on the node.
    #[error("fallo en track {title}: {cause}")]
    TrackError { title: String, cause: String },

    /// The node exhausted its reconnect attempts (or was shut down).
    #[error("el nodo {node} está cerrado")]
    NodeClosed { node: String },

    #[error("error de transporte con el nodo {node}: {message}")]
    Transport { node: String, message: String },

    #[error("error de persistencia: {0}")]
    Persistence(String),

    /// The session actor is gone (destroyed or shutting down).
    #[error("la sesión de guild {0} ya no existe")]
    SessionClosed(GuildId),

    #[error("no hay reproducción activa en guild {0}")]
    NoSession(GuildId),

    #[error("la cola está llena (máximo {0} canciones)")]
    QueueFull(usize),

    #[error("índice fuera de rango: {0}")]
    IndexOutOfRange(usize),

    #[error("no se pudo cargar '{query}': {message}")]
    LoadFailed { query: String, message: String },
}

impl MusicError {
    /// Whether the condition heals on its own (reconnect, migration).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MusicError::NotReady { .. } | MusicError::Transport { .. }
        )
    }
}

pub type MusicResult<T> = std::result::Result<T, MusicError>;
