//! # Audio Module
//!
//! Per-guild playback orchestration. Decoding and streaming happen on the
//! Lavalink nodes; this module decides what they play.
//!
//! ## Architecture
//!
//! ### [`player`] - Playback Session
//! - One actor task per guild owning the queue, current track and policy
//! - Applies user commands and node events one at a time, in arrival order
//! - Re-establishes playback when the pool migrates the guild to another node
//!
//! ### [`registry`] - Session Registry
//! - At most one live session per guild
//! - Creates sessions on the best Ready node, removes them when destroyed
//!
//! ### [`queue`] / [`policy`] / [`track`]
//! - FIFO queue with shuffle, move and remove
//! - Per-guild flags: 24/7, auto-leave, auto-pause, autoqueue, history
//!
//! ### [`autoqueue`] / [`events`]
//! - Recommendations when the queue runs dry
//! - User-facing status updates emitted by sessions
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use helix_music::audio::player::SessionRequest;
//! use helix_music::audio::registry::SessionRegistry;
//! use serenity::model::id::GuildId;
//!
//! # async fn example(registry: std::sync::Arc<SessionRegistry>) -> anyhow::Result<()> {
//! let guild_id = GuildId::new(123456789);
//! let session = registry.get_or_create(guild_id).await?;
//!
//! session.request(SessionRequest::Pause).await?;
//! session.request(SessionRequest::Resume).await?;
//! session.request(SessionRequest::Skip).await?;
//! # Ok(())
//! # }
//! ```

pub mod autoqueue;
pub mod events;
pub mod player;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod track;
