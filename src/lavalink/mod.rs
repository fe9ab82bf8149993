//! # Lavalink Module
//!
//! Connections to the remote audio nodes that do the actual decoding and
//! streaming.
//!
//! ## Architecture
//!
//! - [`node`]: one actor task per configured node. It owns the WebSocket,
//!   answers heartbeats, reconnects with backoff and publishes its health.
//! - [`pool`]: selects the best Ready node, remembers which guild plays on
//!   which node, routes node events to sessions and migrates sessions when a
//!   node goes away.
//! - [`transport`]: the [`transport::Connector`] seam between the actors and
//!   the network.
//! - [`protocol`] / [`rest`]: Lavalink v3 wire formats.

mod backoff;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod rest;
pub mod transport;

use serenity::model::id::{GuildId, UserId};
use std::time::Duration;

use protocol::{guild_key, OutgoingMessage, VoiceServerEvent};

pub use node::{NodeEnvelope, NodeEvent, NodeHandle, NodeHealth, NodeSettings, NodeState};
pub use pool::{NodePool, PoolNotice};

/// Identity the bot presents to every node during the handshake.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub user_id: UserId,
    pub client_name: String,
}

/// Voice server credentials for one guild, as received from Discord.
///
/// Kept by the session so playback can be re-established on another node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceCredentials {
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

/// A request for a node, keyed by guild.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeCommand {
    VoiceUpdate {
        guild_id: GuildId,
        voice: VoiceCredentials,
    },
    Play {
        guild_id: GuildId,
        track: String,
        start: Duration,
        paused: bool,
    },
    Stop {
        guild_id: GuildId,
    },
    Pause {
        guild_id: GuildId,
        paused: bool,
    },
    Seek {
        guild_id: GuildId,
        position: Duration,
    },
    Volume {
        guild_id: GuildId,
        volume: u16,
    },
    Destroy {
        guild_id: GuildId,
    },
}

impl NodeCommand {
    pub fn guild_id(&self) -> GuildId {
        match self {
            NodeCommand::VoiceUpdate { guild_id, .. }
            | NodeCommand::Play { guild_id, .. }
            | NodeCommand::Stop { guild_id }
            | NodeCommand::Pause { guild_id, .. }
            | NodeCommand::Seek { guild_id, .. }
            | NodeCommand::Volume { guild_id, .. }
            | NodeCommand::Destroy { guild_id } => *guild_id,
        }
    }

    pub fn into_message(self) -> OutgoingMessage {
        match self {
            NodeCommand::VoiceUpdate { guild_id, voice } => OutgoingMessage::VoiceUpdate {
                guild_id: guild_key(guild_id),
                session_id: voice.session_id,
                event: VoiceServerEvent {
                    token: voice.token,
                    guild_id: guild_key(guild_id),
                    endpoint: voice.endpoint,
                },
            },
            NodeCommand::Play {
                guild_id,
                track,
                start,
                paused,
            } => OutgoingMessage::Play {
                guild_id: guild_key(guild_id),
                track,
                start_time: start.as_millis() as u64,
                pause: paused,
                no_replace: false,
            },
            NodeCommand::Stop { guild_id } => OutgoingMessage::Stop {
                guild_id: guild_key(guild_id),
            },
            NodeCommand::Pause { guild_id, paused } => OutgoingMessage::Pause {
                guild_id: guild_key(guild_id),
                pause: paused,
            },
            NodeCommand::Seek { guild_id, position } => OutgoingMessage::Seek {
                guild_id: guild_key(guild_id),
                position: position.as_millis() as u64,
            },
            NodeCommand::Volume { guild_id, volume } => OutgoingMessage::Volume {
                guild_id: guild_key(guild_id),
                volume,
            },
            NodeCommand::Destroy { guild_id } => OutgoingMessage::Destroy {
                guild_id: guild_key(guild_id),
            },
        }
    }
}
