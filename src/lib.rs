//! # Helix Music
//!
//! Playback core of a Lavalink-backed Discord music bot: a pool of audio
//! nodes with health tracking and failover, and one playback session per
//! guild driven by user commands and node events.

pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod error;
pub mod lavalink;
pub mod storage;

pub use error::{MusicError, MusicResult};
