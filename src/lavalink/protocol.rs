//! Lavalink v3 WebSocket messages.
//!
//! Outgoing ops are what the bot asks a node to do for a guild; incoming ops
//! are the node's stats, player position updates and track lifecycle events.

use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;

/// Messages sent from the bot to a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OutgoingMessage {
    #[serde(rename_all = "camelCase")]
    VoiceUpdate {
        guild_id: String,
        session_id: String,
        event: VoiceServerEvent,
    },
    #[serde(rename_all = "camelCase")]
    Play {
        guild_id: String,
        track: String,
        start_time: u64,
        pause: bool,
        no_replace: bool,
    },
    #[serde(rename_all = "camelCase")]
    Stop { guild_id: String },
    #[serde(rename_all = "camelCase")]
    Pause { guild_id: String, pause: bool },
    #[serde(rename_all = "camelCase")]
    Seek { guild_id: String, position: u64 },
    #[serde(rename_all = "camelCase")]
    Volume { guild_id: String, volume: u16 },
    #[serde(rename_all = "camelCase")]
    Destroy { guild_id: String },
}

/// Voice server credentials forwarded from the Discord gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceServerEvent {
    pub token: String,
    pub guild_id: String,
    pub endpoint: String,
}

/// Messages received from a node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    #[serde(rename_all = "camelCase")]
    Ready {
        #[serde(default)]
        resumed: bool,
        session_id: String,
    },
    Stats(NodeStats),
    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        guild_id: String,
        state: PlayerUpdateState,
    },
    Event(TrackEventPayload),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateState {
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum TrackEventPayload {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart { guild_id: String, track: String },
    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        guild_id: String,
        track: String,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        guild_id: String,
        track: String,
        #[serde(default)]
        exception: Option<TrackExceptionInfo>,
        /// Lavalink < 3.4 sends a plain string.
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck {
        guild_id: String,
        track: String,
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        guild_id: String,
        code: u16,
        reason: String,
        by_remote: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackExceptionInfo {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub cause: Option<String>,
}

impl TrackEventPayload {
    pub fn guild_id(&self) -> &str {
        match self {
            TrackEventPayload::TrackStart { guild_id, .. }
            | TrackEventPayload::TrackEnd { guild_id, .. }
            | TrackEventPayload::TrackException { guild_id, .. }
            | TrackEventPayload::TrackStuck { guild_id, .. }
            | TrackEventPayload::WebSocketClosed { guild_id, .. } => guild_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    #[serde(default)]
    pub players: u32,
    #[serde(default)]
    pub playing_players: u32,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub cpu: CpuStats,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub system_load: f64,
    #[serde(default)]
    pub lavalink_load: f64,
}

/// Per-minute frame counters; only present once a player is active.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

impl NodeStats {
    /// Penalty score used to rank nodes; lower is better.
    ///
    /// Playing players count one each, CPU load grows exponentially, and
    /// frame deficits/nulls (audio hiccups) weigh heavily.
    pub fn penalty(&self) -> u64 {
        let cpu = (1.05f64.powf(100.0 * self.cpu.system_load) * 10.0 - 10.0).round();
        let cpu = cpu.max(0.0) as u64;

        let (deficit, nulled) = match &self.frame_stats {
            Some(frames) => {
                let deficit = (1.03f64.powf(500.0 * (frames.deficit as f64 / 3000.0)) * 600.0
                    - 600.0)
                    .max(0.0);
                let nulled = ((1.03f64.powf(500.0 * (frames.nulled as f64 / 3000.0)) * 300.0
                    - 300.0)
                    * 2.0)
                    .max(0.0);
                (deficit as u64, nulled as u64)
            }
            None => (0, 0),
        };

        u64::from(self.playing_players) + cpu + deficit + nulled
    }
}

/// Discord snowflakes go over the wire as strings.
pub fn guild_key(guild_id: GuildId) -> String {
    guild_id.get().to_string()
}

pub fn parse_guild(raw: &str) -> Option<GuildId> {
    raw.parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .map(GuildId::new)
}
