use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use serenity::model::id::GuildId;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    audio::player::{PlaybackSession, SessionContext, SessionHandle},
    error::MusicResult,
};

/// At most one live session per guild.
///
/// Sessions remove themselves when they are destroyed; a generation number
/// keeps a stale removal from evicting a newer session of the same guild.
pub struct SessionRegistry {
    sessions: DashMap<GuildId, SessionHandle>,
    generation: AtomicU64,
    ctx: SessionContext,
    closed_tx: mpsc::UnboundedSender<(GuildId, u64)>,
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext) -> Arc<Self> {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            sessions: DashMap::new(),
            generation: AtomicU64::new(0),
            ctx,
            closed_tx,
        });

        tokio::spawn(reap(Arc::downgrade(&registry), closed_rx));
        registry
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Live session of a guild, if any.
    pub fn get(&self, guild_id: GuildId) -> Option<SessionHandle> {
        self.sessions
            .get(&guild_id)
            .map(|s| s.clone())
            .filter(|s| !s.is_closed())
    }

    pub fn contains(&self, guild_id: GuildId) -> bool {
        self.get(guild_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Returns the guild's session, creating it on the best Ready node.
    ///
    /// Fails with `NoAvailableNode` without registering anything when no
    /// node can take the guild.
    pub async fn get_or_create(&self, guild_id: GuildId) -> MusicResult<SessionHandle> {
        if let Some(session) = self.get(guild_id) {
            return Ok(session);
        }

        let node = self.ctx.pool.select_node()?;
        let policy = match self.ctx.store.load_policy(guild_id).await {
            Ok(policy) => policy.unwrap_or(self.ctx.default_policy),
            Err(e) => {
                warn!(
                    "Guild {}: política no disponible, usando la predeterminada: {}",
                    guild_id, e
                );
                self.ctx.default_policy
            }
        };

        // Someone else may have created it while the policy was loading.
        let session = match self.sessions.entry(guild_id) {
            Entry::Occupied(entry) if !entry.get().is_closed() => entry.get().clone(),
            entry => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let session = PlaybackSession::spawn(
                    guild_id,
                    generation,
                    node.identifier(),
                    policy,
                    self.ctx.clone(),
                    self.closed_tx.clone(),
                );
                entry.insert(session.clone());
                session
            }
        };
        Ok(session)
    }

    /// Leaves the guild. Calling it again, or for an unknown guild, does
    /// nothing.
    ///
    /// Returns once the old session is torn down, so a session created
    /// afterwards never has its node player or routing undone by it.
    pub async fn remove(&self, guild_id: GuildId) {
        let Some(session) = self.sessions.get(&guild_id).map(|s| s.clone()) else {
            return;
        };

        session.leave().await;
        let generation = session.generation();
        self.sessions
            .remove_if(&guild_id, |_, s| s.generation() == generation);
        info!("🗑️ Sesión de guild {} eliminada", guild_id);
    }

    /// Saves every session's resume point, destroys them and closes the
    /// pool.
    pub async fn shutdown(&self) {
        let sessions: Vec<SessionHandle> = self.sessions.iter().map(|s| s.clone()).collect();
        info!("🛑 Cerrando {} sesiones", sessions.len());

        join_all(sessions.iter().map(|s| s.drain())).await;
        self.sessions.clear();
        self.ctx.pool.shutdown();
    }
}

async fn reap(
    registry: Weak<SessionRegistry>,
    mut closed: mpsc::UnboundedReceiver<(GuildId, u64)>,
) {
    while let Some((guild_id, generation)) = closed.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        if registry
            .sessions
            .remove_if(&guild_id, |_, s| s.generation() == generation)
            .is_some()
        {
            debug!("Guild {}: sesión {} retirada", guild_id, generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{
            player::{
                tests::{context, quiet_store, settle, track},
                SessionRequest, SessionState,
            },
            policy::PlaybackPolicy,
        },
        error::MusicError,
        lavalink::pool::tests::fake_pool,
        storage::MockPolicyStore,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const GUILD: GuildId = GuildId::new(20);

    fn store_with_policy(policy: PlaybackPolicy) -> MockPolicyStore {
        let mut store = MockPolicyStore::new();
        store
            .expect_load_policy()
            .returning(move |_| Ok(Some(policy)));
        store.expect_save_policy().returning(|_, _| Ok(()));
        store.expect_append_history().returning(|_, _| Ok(()));
        store.expect_save_resume_point().returning(|_, _| Ok(()));
        store
    }

    #[tokio::test(start_paused = true)]
    async fn no_ready_node_registers_nothing() {
        let (pool, _connector, _remotes) = fake_pool(&["A"], &["A"]).await;
        let (ctx, _status) = context(pool, quiet_store(), None);
        let registry = SessionRegistry::new(ctx);

        assert_eq!(
            registry.get_or_create(GUILD).await.err(),
            Some(MusicError::NoAvailableNode)
        );
        assert!(!registry.contains(GUILD));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_create_reuses_the_live_session() {
        let (pool, _connector, _remotes) = fake_pool(&["A"], &[]).await;
        let (ctx, _status) = context(pool, quiet_store(), None);
        let registry = SessionRegistry::new(ctx);

        let first = registry.get_or_create(GUILD).await.unwrap();
        let second = registry.get_or_create(GUILD).await.unwrap();

        assert_eq!(first.generation(), second.generation());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stored_policy_is_applied_to_new_sessions() {
        let (pool, _connector, _remotes) = fake_pool(&["A"], &[]).await;
        let policy = PlaybackPolicy {
            auto_queue: true,
            history: true,
            ..PlaybackPolicy::default()
        };
        let (ctx, _status) = context(pool, store_with_policy(policy), None);
        let registry = SessionRegistry::new(ctx);

        let session = registry.get_or_create(GUILD).await.unwrap();

        assert_eq!(session.snapshot().await.unwrap().policy, policy);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_leave_removes_the_session_after_grace() {
        let (pool, _connector, _remotes) = fake_pool(&["A"], &[]).await;
        let policy = PlaybackPolicy {
            auto_leave: true,
            ..PlaybackPolicy::default()
        };
        let (ctx, _status) = context(pool.clone(), store_with_policy(policy), None);
        let registry = SessionRegistry::new(ctx);
        registry.get_or_create(GUILD).await.unwrap();
        settle().await;
        assert_eq!(pool.assigned_node(GUILD).await.as_deref(), Some("A"));

        tokio::time::sleep(Duration::from_secs(301)).await;
        settle().await;

        assert!(!registry.contains(GUILD));
        assert!(registry.is_empty());
        assert_eq!(pool.assigned_node(GUILD).await, None);

        // The guild can come back with a fresh session.
        let again = registry.get_or_create(GUILD).await.unwrap();
        assert_eq!(again.generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn twenty_four_seven_session_outlives_idle_period() {
        let (pool, _connector, _remotes) = fake_pool(&["A"], &[]).await;
        let policy = PlaybackPolicy {
            auto_leave: true,
            twenty_four_seven: true,
            ..PlaybackPolicy::default()
        };
        let (ctx, _status) = context(pool, store_with_policy(policy), None);
        let registry = SessionRegistry::new(ctx);
        registry.get_or_create(GUILD).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3000)).await;
        settle().await;

        assert!(registry.contains(GUILD));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_is_idempotent() {
        let (pool, _connector, _remotes) = fake_pool(&["A"], &[]).await;
        let (ctx, _status) = context(pool, quiet_store(), None);
        let registry = SessionRegistry::new(ctx);
        let session = registry.get_or_create(GUILD).await.unwrap();

        registry.remove(GUILD).await;
        registry.remove(GUILD).await;
        registry.remove(GuildId::new(999)).await;
        settle().await;

        assert!(registry.is_empty());
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_removal_keeps_newer_session() {
        let (pool, _connector, _remotes) = fake_pool(&["A"], &[]).await;
        let (ctx, _status) = context(pool, quiet_store(), None);
        let registry = SessionRegistry::new(ctx);

        let old = registry.get_or_create(GUILD).await.unwrap();
        registry.remove(GUILD).await;
        settle().await;
        let fresh = registry.get_or_create(GUILD).await.unwrap();

        // A late close notice from the old session.
        registry.closed_tx.send((GUILD, old.generation())).unwrap();
        settle().await;

        assert_eq!(registry.get(GUILD).map(|s| s.generation()), Some(fresh.generation()));
        assert_ne!(old.generation(), fresh.generation());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_saves_resume_points() {
        let (pool, _connector, _remotes) = fake_pool(&["A"], &[]).await;
        let mut store = MockPolicyStore::new();
        store.expect_load_policy().returning(|_| Ok(None));
        store
            .expect_save_resume_point()
            .withf(|guild, point| {
                *guild == GUILD
                    && point
                        .as_ref()
                        .is_some_and(|p| p.track.title == "Track 1" && p.upcoming.len() == 1)
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let (ctx, _status) = context(pool.clone(), store, None);
        let registry = SessionRegistry::new(ctx);
        let session = registry.get_or_create(GUILD).await.unwrap();
        let snapshot = session
            .request(SessionRequest::Enqueue(vec![track(1), track(2)]))
            .await
            .unwrap();
        assert_eq!(snapshot.state, SessionState::Playing);

        registry.shutdown().await;
        settle().await;

        assert!(registry.is_empty());
        assert!(session.is_closed());
        assert!(pool.nodes().iter().all(|n| !n.is_ready()));
    }
}
