//! # Bot Module
//!
//! The boundary between Discord and the playback core.
//!
//! - [`gateway`]: [`gateway::Gateway`] turns each inbound command (slash
//!   command, voice server update, voice state change) into a registry
//!   call and returns the resulting session state.
//! - [`events`]: consumes the outbound [`StatusUpdate`] stream.
//!
//! Rendering (embeds, buttons) and the Discord client itself live outside
//! this crate; they only need a [`gateway::Gateway`] and the status
//! receiver.
//!
//! [`StatusUpdate`]: crate::audio::events::StatusUpdate

pub mod events;
pub mod gateway;

pub use gateway::{CommandOutcome, Gateway, GatewayCommand};
