use serenity::model::id::{GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        player::{SessionRequest, SessionSnapshot},
        policy::PolicyPatch,
        registry::SessionRegistry,
        track::Track,
    },
    error::{MusicError, MusicResult},
    lavalink::VoiceCredentials,
};

/// Everything the Discord side can ask of the playback core.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCommand {
    /// URL or search text.
    Play { query: String, requester: UserId },
    Skip,
    Pause,
    Resume,
    Stop,
    Seek(Duration),
    Volume(u16),
    Remove(usize),
    Move { from: usize, to: usize },
    Shuffle,
    Clear,
    SetPolicy(PolicyPatch),
    VoiceUpdate(VoiceCredentials),
    /// Non-bot members left in the bot's voice channel.
    ListenersChanged(usize),
    NowPlaying,
    Leave,
}

impl GatewayCommand {
    fn name(&self) -> &'static str {
        match self {
            GatewayCommand::Play { .. } => "play",
            GatewayCommand::Skip => "skip",
            GatewayCommand::Pause => "pause",
            GatewayCommand::Resume => "resume",
            GatewayCommand::Stop => "stop",
            GatewayCommand::Seek(_) => "seek",
            GatewayCommand::Volume(_) => "volume",
            GatewayCommand::Remove(_) => "remove",
            GatewayCommand::Move { .. } => "move",
            GatewayCommand::Shuffle => "shuffle",
            GatewayCommand::Clear => "clear",
            GatewayCommand::SetPolicy(_) => "policy",
            GatewayCommand::VoiceUpdate(_) => "voice_update",
            GatewayCommand::ListenersChanged(_) => "listeners",
            GatewayCommand::NowPlaying => "nowplaying",
            GatewayCommand::Leave => "leave",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// `added` tracks went to the queue (or straight to playback).
    Queued {
        added: usize,
        first: Track,
        snapshot: SessionSnapshot,
    },
    Session(SessionSnapshot),
    Left,
    /// Nothing to act on (no session for a passive event).
    Ignored,
}

/// Entry point for every command coming from Discord.
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<SessionRegistry>,
}

impl Gateway {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn handle(
        &self,
        guild_id: GuildId,
        command: GatewayCommand,
    ) -> MusicResult<CommandOutcome> {
        let name = command.name();
        debug!("📥 Guild {}: comando {}", guild_id, name);

        let result = self.dispatch(guild_id, command).await;
        if let Err(e) = &result {
            if e.is_transient() {
                warn!("⏳ Guild {}: {} falló temporalmente: {}", guild_id, name, e);
            } else {
                info!("Guild {}: {} rechazado: {}", guild_id, name, e);
            }
        }
        result
    }

    async fn dispatch(
        &self,
        guild_id: GuildId,
        command: GatewayCommand,
    ) -> MusicResult<CommandOutcome> {
        let request = match command {
            GatewayCommand::Play { query, requester } => {
                return self.play(guild_id, &query, requester).await
            }
            GatewayCommand::Leave => {
                self.registry.remove(guild_id).await;
                return Ok(CommandOutcome::Left);
            }
            GatewayCommand::VoiceUpdate(voice) => {
                let session = self.registry.get_or_create(guild_id).await?;
                let snapshot = session.request(SessionRequest::VoiceUpdate(voice)).await?;
                return Ok(CommandOutcome::Session(snapshot));
            }
            GatewayCommand::ListenersChanged(count) => {
                let Some(session) = self.registry.get(guild_id) else {
                    return Ok(CommandOutcome::Ignored);
                };
                let snapshot = session
                    .request(SessionRequest::ListenersChanged(count))
                    .await?;
                return Ok(CommandOutcome::Session(snapshot));
            }
            GatewayCommand::Skip => SessionRequest::Skip,
            GatewayCommand::Pause => SessionRequest::Pause,
            GatewayCommand::Resume => SessionRequest::Resume,
            GatewayCommand::Stop => SessionRequest::Stop,
            GatewayCommand::Seek(position) => SessionRequest::Seek(position),
            GatewayCommand::Volume(volume) => SessionRequest::Volume(volume),
            GatewayCommand::Remove(index) => SessionRequest::Remove(index),
            GatewayCommand::Move { from, to } => SessionRequest::Move { from, to },
            GatewayCommand::Shuffle => SessionRequest::Shuffle,
            GatewayCommand::Clear => SessionRequest::Clear,
            GatewayCommand::SetPolicy(patch) => SessionRequest::SetPolicy(patch),
            GatewayCommand::NowPlaying => SessionRequest::Snapshot,
        };

        let session = self
            .registry
            .get(guild_id)
            .ok_or(MusicError::NoSession(guild_id))?;
        let snapshot = session.request(request).await?;
        Ok(CommandOutcome::Session(snapshot))
    }

    async fn play(
        &self,
        guild_id: GuildId,
        query: &str,
        requester: UserId,
    ) -> MusicResult<CommandOutcome> {
        let tracks = self
            .registry
            .context()
            .pool
            .load_tracks(query, requester)
            .await?;
        let first = tracks
            .first()
            .cloned()
            .ok_or_else(|| MusicError::LoadFailed {
                query: query.to_string(),
                message: "sin resultados".to_string(),
            })?;
        let added = tracks.len();

        // A session may close between lookup and enqueue; one retry gets
        // a fresh one.
        let mut retried = false;
        loop {
            let session = self.registry.get_or_create(guild_id).await?;
            match session.request(SessionRequest::Enqueue(tracks.clone())).await {
                Err(MusicError::SessionClosed(_)) if !retried => {
                    debug!("Guild {}: sesión cerrada al encolar, reintentando", guild_id);
                    retried = true;
                }
                Ok(snapshot) => {
                    info!(
                        "🎶 Guild {}: {} tracks encolados ({})",
                        guild_id, added, first.title
                    );
                    return Ok(CommandOutcome::Queued {
                        added,
                        first,
                        snapshot,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::player::{
            tests::{context, quiet_store, settle, track},
            SessionContext, SessionState,
        },
        lavalink::{
            pool::tests::fake_pool,
            protocol::{IncomingMessage, OutgoingMessage, TrackEndReason, TrackEventPayload},
            rest::search_identifier,
            transport::fake::FakeRemote,
        },
    };
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    const GUILD: GuildId = GuildId::new(30);

    /// The fake node links stay open while the returned remotes live.
    async fn gateway(down: &[&str]) -> (Gateway, SessionContext, HashMap<String, FakeRemote>) {
        let (pool, _connector, remotes) = fake_pool(&["A"], down).await;
        let (ctx, _status) = context(pool, quiet_store(), None);
        (Gateway::new(SessionRegistry::new(ctx.clone())), ctx, remotes)
    }

    #[tokio::test(start_paused = true)]
    async fn play_creates_session_and_starts_first_result() {
        let (gateway, ctx, _remotes) = gateway(&[]).await;
        ctx.pool
            .search_cache()
            .insert(search_identifier("lofi beats"), vec![track(1)]);

        let outcome = gateway
            .handle(
                GUILD,
                GatewayCommand::Play {
                    query: "lofi beats".into(),
                    requester: UserId::new(77),
                },
            )
            .await
            .unwrap();

        let CommandOutcome::Queued {
            added,
            first,
            snapshot,
        } = outcome
        else {
            panic!("se esperaba Queued");
        };
        assert_eq!(added, 1);
        assert_eq!(first.requester, UserId::new(77));
        assert_eq!(snapshot.state, SessionState::Playing);
        assert!(gateway.registry().contains(GUILD));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_without_session_are_rejected() {
        let (gateway, _ctx, _remotes) = gateway(&[]).await;

        assert_eq!(
            gateway.handle(GUILD, GatewayCommand::Skip).await,
            Err(MusicError::NoSession(GUILD))
        );
        assert_eq!(
            gateway
                .handle(GUILD, GatewayCommand::ListenersChanged(0))
                .await,
            Ok(CommandOutcome::Ignored)
        );
        assert_eq!(
            gateway.handle(GUILD, GatewayCommand::Leave).await,
            Ok(CommandOutcome::Left)
        );
        assert!(gateway.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn play_without_nodes_creates_nothing() {
        let (gateway, ctx, _remotes) = gateway(&["A"]).await;
        ctx.pool
            .search_cache()
            .insert(search_identifier("lofi"), vec![track(1)]);

        let result = gateway
            .handle(
                GUILD,
                GatewayCommand::Play {
                    query: "lofi".into(),
                    requester: UserId::new(1),
                },
            )
            .await;

        assert_eq!(result, Err(MusicError::NoAvailableNode));
        assert!(gateway.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn leave_then_play_gets_a_fresh_session() {
        let (gateway, ctx, _remotes) = gateway(&[]).await;
        ctx.pool
            .search_cache()
            .insert(search_identifier("song"), vec![track(1)]);
        let play = || GatewayCommand::Play {
            query: "song".into(),
            requester: UserId::new(1),
        };

        gateway.handle(GUILD, play()).await.unwrap();
        gateway.handle(GUILD, GatewayCommand::Leave).await.unwrap();
        settle().await;
        gateway.handle(GUILD, play()).await.unwrap();

        let Ok(CommandOutcome::Session(snapshot)) =
            gateway.handle(GUILD, GatewayCommand::NowPlaying).await
        else {
            panic!("se esperaba un snapshot");
        };
        assert_eq!(snapshot.current.map(|t| t.title).as_deref(), Some("Track 1"));
        assert_eq!(gateway.registry().get(GUILD).map(|s| s.generation()), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_leave_and_play_keep_node_events_flowing() {
        let (gateway, ctx, mut remotes) = gateway(&[]).await;
        ctx.pool
            .search_cache()
            .insert(search_identifier("song"), vec![track(1), track(2)]);
        let play = || GatewayCommand::Play {
            query: "song".into(),
            requester: UserId::new(1),
        };

        gateway.handle(GUILD, play()).await.unwrap();
        gateway.handle(GUILD, GatewayCommand::Leave).await.unwrap();
        gateway.handle(GUILD, play()).await.unwrap();
        settle().await;

        assert_eq!(gateway.registry().len(), 1);
        assert_eq!(ctx.pool.assigned_node(GUILD).await.as_deref(), Some("A"));

        // The old player is destroyed before the new one starts.
        let node = remotes.get_mut("A").unwrap();
        let ops = node.drain_ops();
        let destroy = ops
            .iter()
            .position(|op| matches!(op, OutgoingMessage::Destroy { .. }))
            .expect("sin destroy");
        assert!(destroy < ops.len() - 1);
        assert!(matches!(
            ops.last(),
            Some(OutgoingMessage::Play { track, .. }) if track == "enc1"
        ));

        node.send(IncomingMessage::Event(TrackEventPayload::TrackEnd {
            guild_id: "30".into(),
            track: "enc1".into(),
            reason: TrackEndReason::Finished,
        }));
        settle().await;

        let Ok(CommandOutcome::Session(snapshot)) =
            gateway.handle(GUILD, GatewayCommand::NowPlaying).await
        else {
            panic!("se esperaba un snapshot");
        };
        assert_eq!(snapshot.current.map(|t| t.title).as_deref(), Some("Track 2"));
    }
}
