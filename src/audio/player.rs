//! Per-guild playback session.
//!
//! Each guild gets one actor task owning its queue, current track and
//! policy. User commands arrive on the mailbox, node events and migration
//! notices arrive from the pool; both are applied one at a time.

use serenity::model::id::GuildId;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        autoqueue::TrackRecommender,
        events::StatusUpdate,
        policy::{PlaybackPolicy, PolicyPatch},
        queue::MusicQueue,
        track::{ResumePoint, Track},
    },
    error::{MusicError, MusicResult},
    lavalink::{
        protocol::TrackEndReason, NodeCommand, NodeEvent, NodePool, PoolNotice,
        VoiceCredentials,
    },
    storage::PolicyStore,
};

const MAX_FAILED: usize = 10;
const MAX_RECENT: usize = 25;
const DEFAULT_VOLUME: u16 = 100;
const MAX_VOLUME: u16 = 1000;

/// Discord closed the voice socket because the bot was disconnected.
const VOICE_CLOSE_DISCONNECTED: u16 = 4014;

/// Everything a session needs from the rest of the system.
#[derive(Clone)]
pub struct SessionContext {
    pub pool: NodePool,
    pub store: Arc<dyn PolicyStore>,
    pub recommender: Option<Arc<dyn TrackRecommender>>,
    pub status: flume::Sender<StatusUpdate>,
    pub default_policy: PlaybackPolicy,
    pub auto_leave_grace: Duration,
    pub max_queue_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    User,
    NoListeners,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Playing,
    Paused(PauseReason),
    Destroyed,
}

/// Read-only view of a session, returned by every request.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub guild_id: GuildId,
    pub node: String,
    pub state: SessionState,
    pub current: Option<Track>,
    pub position: Duration,
    pub queue: Vec<Track>,
    /// Sum of the upcoming tracks' lengths.
    pub queue_duration: Duration,
    pub policy: PlaybackPolicy,
    pub volume: u16,
    pub listeners: Option<usize>,
    /// Most recent last.
    pub failed: Vec<Track>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionRequest {
    Enqueue(Vec<Track>),
    Skip,
    Pause,
    Resume,
    /// Clears the queue and the current track.
    Stop,
    Seek(Duration),
    Volume(u16),
    Remove(usize),
    Move { from: usize, to: usize },
    Shuffle,
    Clear,
    SetPolicy(PolicyPatch),
    VoiceUpdate(VoiceCredentials),
    ListenersChanged(usize),
    Snapshot,
    Leave,
}

enum Mailbox {
    Request(SessionRequest, oneshot::Sender<MusicResult<SessionSnapshot>>),
    /// Shutdown: persist where playback stands, then tear down.
    Drain(oneshot::Sender<()>),
}

/// Cloneable address of a session actor.
#[derive(Clone)]
pub struct SessionHandle {
    guild_id: GuildId,
    generation: u64,
    mailbox: mpsc::UnboundedSender<Mailbox>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("guild_id", &self.guild_id)
            .field("generation", &self.generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionHandle {
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The actor has stopped; requests would fail with `SessionClosed`.
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// Queues a request behind everything sent before it and waits for the
    /// resulting state.
    pub async fn request(&self, request: SessionRequest) -> MusicResult<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.mailbox
            .send(Mailbox::Request(request, reply))
            .map_err(|_| MusicError::SessionClosed(self.guild_id))?;
        rx.await
            .map_err(|_| MusicError::SessionClosed(self.guild_id))?
    }

    pub async fn snapshot(&self) -> MusicResult<SessionSnapshot> {
        self.request(SessionRequest::Snapshot).await
    }

    /// Leaves the guild and waits until the node player is destroyed and
    /// the pool no longer routes to this session.
    pub(crate) async fn leave(&self) {
        if let Err(e) = self.request(SessionRequest::Leave).await {
            debug!("Guild {}: la sesión ya estaba cerrada: {}", self.guild_id, e);
        }
    }

    pub(crate) async fn drain(&self) {
        let (done, rx) = oneshot::channel();
        if self.mailbox.send(Mailbox::Drain(done)).is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct PlaybackSession {
    guild_id: GuildId,
    generation: u64,
    node: String,
    ctx: SessionContext,

    queue: MusicQueue,
    policy: PlaybackPolicy,
    state: SessionState,
    current: Option<Track>,
    position: Duration,
    volume: u16,
    voice: Option<VoiceCredentials>,
    listeners: Option<usize>,
    failed: VecDeque<Track>,
    /// Identifiers played lately, fed to the recommender.
    recent: VecDeque<String>,

    /// A stop was sent for a skip and its TrackEnded has not arrived.
    pending_skip: bool,
    /// The TrackEnded that follows an exception for this track is dropped.
    swallow_end_for: Option<String>,
    idle_deadline: Option<Instant>,
    node_warned: bool,

    mailbox: mpsc::UnboundedReceiver<Mailbox>,
    notices: mpsc::UnboundedReceiver<PoolNotice>,
    /// Our end of the routing; the pool only releases a matching one.
    route: mpsc::UnboundedSender<PoolNotice>,
    closed: mpsc::UnboundedSender<(GuildId, u64)>,
}

impl PlaybackSession {
    /// Starts a session on `node` and registers it with the pool.
    ///
    /// When the actor stops it reports `(guild_id, generation)` on
    /// `closed`.
    pub fn spawn(
        guild_id: GuildId,
        generation: u64,
        node: &str,
        policy: PlaybackPolicy,
        ctx: SessionContext,
        closed: mpsc::UnboundedSender<(GuildId, u64)>,
    ) -> SessionHandle {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        ctx.pool.assign(guild_id, node, notice_tx.clone());

        let session = PlaybackSession {
            guild_id,
            generation,
            node: node.to_string(),
            queue: MusicQueue::new(ctx.max_queue_size),
            ctx,
            policy,
            state: SessionState::Idle,
            current: None,
            position: Duration::ZERO,
            volume: DEFAULT_VOLUME,
            voice: None,
            listeners: None,
            failed: VecDeque::new(),
            recent: VecDeque::new(),
            pending_skip: false,
            swallow_end_for: None,
            idle_deadline: None,
            node_warned: false,
            mailbox: mailbox_rx,
            notices: notice_rx,
            route: notice_tx,
            closed,
        };

        info!("🎶 Sesión creada para guild {} en nodo {}", guild_id, node);
        tokio::spawn(session.run());

        SessionHandle {
            guild_id,
            generation,
            mailbox: mailbox_tx,
        }
    }

    async fn run(mut self) {
        self.refresh_idle_timer();

        while self.state != SessionState::Destroyed {
            let deadline = self.idle_deadline;

            tokio::select! {
                biased;

                Some(notice) = self.notices.recv() => self.on_notice(notice).await,

                message = self.mailbox.recv() => match message {
                    Some(Mailbox::Request(request, reply)) => {
                        let result = self.handle(request).await;
                        let _ = reply.send(result.map(|_| self.snapshot()));
                    }
                    Some(Mailbox::Drain(done)) => {
                        self.save_resume_point().await;
                        self.teardown(None);
                        let _ = done.send(());
                    }
                    None => self.teardown(None),
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    info!(
                        "⏰ Guild {}: inactiva durante {:?}, abandonando",
                        self.guild_id, self.ctx.auto_leave_grace
                    );
                    self.teardown(Some(StatusUpdate::Left { guild_id: self.guild_id }));
                }
            }

            self.refresh_idle_timer();
        }

        let _ = self.closed.send((self.guild_id, self.generation));
        debug!("Sesión de guild {} finalizada", self.guild_id);
    }

    async fn handle(&mut self, request: SessionRequest) -> MusicResult<()> {
        match request {
            SessionRequest::Enqueue(tracks) => self.enqueue(tracks),
            SessionRequest::Skip => self.skip().await,
            SessionRequest::Pause => self.pause(),
            SessionRequest::Resume => self.resume(),
            SessionRequest::Stop => {
                self.stop();
                Ok(())
            }
            SessionRequest::Seek(position) => self.seek(position),
            SessionRequest::Volume(volume) => self.set_volume(volume),
            SessionRequest::Remove(index) => self.queue.remove_track(index).map(|_| ()),
            SessionRequest::Move { from, to } => self.queue.move_track(from, to),
            SessionRequest::Shuffle => {
                self.queue.shuffle();
                Ok(())
            }
            SessionRequest::Clear => {
                self.queue.clear();
                Ok(())
            }
            SessionRequest::SetPolicy(patch) => {
                self.set_policy(patch).await;
                Ok(())
            }
            SessionRequest::VoiceUpdate(voice) => {
                self.voice = Some(voice.clone());
                self.send(NodeCommand::VoiceUpdate {
                    guild_id: self.guild_id,
                    voice,
                });
                Ok(())
            }
            SessionRequest::ListenersChanged(count) => {
                self.listeners_changed(count);
                Ok(())
            }
            SessionRequest::Snapshot => Ok(()),
            SessionRequest::Leave => {
                self.teardown(Some(StatusUpdate::Left {
                    guild_id: self.guild_id,
                }));
                Ok(())
            }
        }
    }

    fn enqueue(&mut self, tracks: Vec<Track>) -> MusicResult<()> {
        let added = self.queue.add_tracks(tracks)?;
        debug!("Guild {}: {} tracks encolados", self.guild_id, added);

        if self.state == SessionState::Idle && self.current.is_none() {
            if let Some(track) = self.queue.next_track() {
                self.start(track);
            }
        }
        Ok(())
    }

    async fn skip(&mut self) -> MusicResult<()> {
        if self.current.is_none() {
            return Err(MusicError::NoSession(self.guild_id));
        }
        if self.pending_skip {
            debug!("⏭️ Guild {}: skip ya pendiente, se combina", self.guild_id);
            return Ok(());
        }

        match self.dispatch(NodeCommand::Stop {
            guild_id: self.guild_id,
        }) {
            Ok(()) => self.pending_skip = true,
            // No TrackEnded will come from a node that is not Ready.
            Err(e) => {
                debug!("⏭️ Guild {}: skip local ({})", self.guild_id, e);
                self.advance().await;
            }
        }
        Ok(())
    }

    fn pause(&mut self) -> MusicResult<()> {
        if self.current.is_none() {
            return Err(MusicError::NoSession(self.guild_id));
        }
        if self.state != SessionState::Paused(PauseReason::User) {
            self.dispatch(NodeCommand::Pause {
                guild_id: self.guild_id,
                paused: true,
            })?;
            self.state = SessionState::Paused(PauseReason::User);
        }
        Ok(())
    }

    fn resume(&mut self) -> MusicResult<()> {
        if let SessionState::Paused(_) = self.state {
            self.dispatch(NodeCommand::Pause {
                guild_id: self.guild_id,
                paused: false,
            })?;
            self.state = SessionState::Playing;
        }
        Ok(())
    }

    fn stop(&mut self) {
        let cleared = self.queue.clear();
        let had_track = self.current.take().is_some();
        self.position = Duration::ZERO;
        self.pending_skip = false;
        self.swallow_end_for = None;
        self.state = SessionState::Idle;

        if had_track {
            self.send(NodeCommand::Stop {
                guild_id: self.guild_id,
            });
        }
        info!("⏹️ Guild {}: detenido ({} en cola descartados)", self.guild_id, cleared);
    }

    fn seek(&mut self, position: Duration) -> MusicResult<()> {
        let track = self
            .current
            .as_ref()
            .ok_or(MusicError::NoSession(self.guild_id))?;
        if track.is_stream {
            return Err(MusicError::TrackError {
                title: track.title.clone(),
                cause: "no se puede buscar en un stream".to_string(),
            });
        }

        let position = position.min(track.length);
        self.dispatch(NodeCommand::Seek {
            guild_id: self.guild_id,
            position,
        })?;
        self.position = position;
        Ok(())
    }

    fn set_volume(&mut self, volume: u16) -> MusicResult<()> {
        let volume = volume.min(MAX_VOLUME);
        self.dispatch(NodeCommand::Volume {
            guild_id: self.guild_id,
            volume,
        })?;
        self.volume = volume;
        Ok(())
    }

    async fn set_policy(&mut self, patch: PolicyPatch) {
        self.policy.apply(patch);
        info!("⚙️ Guild {}: política {:?}", self.guild_id, self.policy);

        if let Err(e) = self.ctx.store.save_policy(self.guild_id, self.policy).await {
            warn!("Guild {}: no se pudo guardar la política: {}", self.guild_id, e);
        }
    }

    fn listeners_changed(&mut self, count: usize) {
        self.listeners = Some(count);

        match self.state {
            SessionState::Playing if count == 0 && self.policy.auto_pause => {
                self.send(NodeCommand::Pause {
                    guild_id: self.guild_id,
                    paused: true,
                });
                self.state = SessionState::Paused(PauseReason::NoListeners);
                info!("⏸️ Guild {}: sin oyentes, pausado", self.guild_id);
                self.notify(StatusUpdate::AutoPaused {
                    guild_id: self.guild_id,
                });
            }
            SessionState::Paused(PauseReason::NoListeners) if count > 0 => {
                self.send(NodeCommand::Pause {
                    guild_id: self.guild_id,
                    paused: false,
                });
                self.state = SessionState::Playing;
                info!("▶️ Guild {}: oyentes de vuelta, reanudado", self.guild_id);
                self.notify(StatusUpdate::AutoResumed {
                    guild_id: self.guild_id,
                });
            }
            _ => {}
        }
    }

    async fn on_notice(&mut self, notice: PoolNotice) {
        match notice {
            PoolNotice::Event(event) => self.on_event(event).await,
            PoolNotice::Migrated { from, to } => {
                self.node = to.clone();
                self.interrupted(from, Some(to)).await;
            }
            PoolNotice::NodeRecovered { node } => {
                self.interrupted(node.clone(), Some(node)).await;
            }
            PoolNotice::NodeLost { node } => {
                self.interrupted(node, None).await;
                self.save_resume_point().await;
                self.teardown(None);
            }
        }
    }

    /// Warns once about a lost node and re-establishes playback on the
    /// node now serving the guild, if any.
    async fn interrupted(&mut self, from: String, to: Option<String>) {
        self.node_warned = false;

        if self.current.is_some() {
            warn!(
                "🔀 Guild {}: reproducción interrumpida en {} → {:?}",
                self.guild_id, from, to
            );
            self.notify(StatusUpdate::PlaybackInterrupted {
                guild_id: self.guild_id,
                from,
                to: to.clone(),
            });
        }

        if to.is_some() {
            self.reestablish().await;
        }
    }

    async fn reestablish(&mut self) {
        if let Some(voice) = self.voice.clone() {
            self.send(NodeCommand::VoiceUpdate {
                guild_id: self.guild_id,
                voice,
            });
        }
        if self.volume != DEFAULT_VOLUME {
            self.send(NodeCommand::Volume {
                guild_id: self.guild_id,
                volume: self.volume,
            });
        }

        if self.pending_skip {
            self.advance().await;
            return;
        }

        if let Some(track) = &self.current {
            let command = NodeCommand::Play {
                guild_id: self.guild_id,
                track: track.encoded.clone(),
                start: self.position,
                paused: matches!(self.state, SessionState::Paused(_)),
            };
            info!(
                "▶️ Guild {}: retomando {} en {} desde {:?}",
                self.guild_id, track.title, self.node, self.position
            );
            self.send(command);
        }
    }

    async fn on_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::TrackStarted { track, .. } => {
                if !self.is_current(&track) {
                    return;
                }
                self.swallow_end_for = None;
                if let Some(current) = self.current.clone() {
                    self.notify(StatusUpdate::NowPlaying {
                        guild_id: self.guild_id,
                        track: current,
                    });
                }
            }
            NodeEvent::PlayerUpdated { position, .. } => {
                if self.current.is_some() {
                    self.position = position;
                }
            }
            NodeEvent::TrackEnded { track, reason, .. } => {
                if self.swallow_end_for.as_deref() == Some(track.as_str()) {
                    self.swallow_end_for = None;
                    debug!("Guild {}: fin tras excepción ignorado", self.guild_id);
                    return;
                }
                if !self.is_current(&track) {
                    debug!("Guild {}: fin de track ajeno ignorado", self.guild_id);
                    return;
                }

                match reason {
                    TrackEndReason::Replaced | TrackEndReason::Cleanup => {}
                    TrackEndReason::Finished => {
                        self.record_history().await;
                        self.advance().await;
                    }
                    TrackEndReason::LoadFailed => {
                        self.record_failure("no se pudo cargar el track".to_string());
                        self.advance().await;
                    }
                    TrackEndReason::Stopped => self.advance().await,
                }
            }
            NodeEvent::TrackError { track, cause, .. } => {
                if !self.is_current(&track) {
                    return;
                }
                self.record_failure(cause);
                self.swallow_end_for = Some(track);
                self.advance().await;

                // A stuck track keeps running on the node unless replaced.
                if self.current.is_none() {
                    self.send(NodeCommand::Stop {
                        guild_id: self.guild_id,
                    });
                }
            }
            NodeEvent::VoiceSocketClosed { code, reason, .. } => {
                if code == VOICE_CLOSE_DISCONNECTED {
                    info!("🔇 Guild {}: desconectado del canal de voz", self.guild_id);
                    self.teardown(Some(StatusUpdate::Left {
                        guild_id: self.guild_id,
                    }));
                } else {
                    warn!(
                        "Guild {}: socket de voz cerrado ({}): {}",
                        self.guild_id, code, reason
                    );
                }
            }
            _ => {}
        }
    }

    /// The current track is over: start exactly one next track, or go
    /// Idle.
    async fn advance(&mut self) {
        let finished = self.current.take();
        self.position = Duration::ZERO;
        self.pending_skip = false;

        let next = match self.queue.next_track() {
            Some(track) => Some(track),
            None => self.recommend(finished.as_ref()).await,
        };

        match next {
            Some(track) => self.start(track),
            None => {
                self.state = SessionState::Idle;
                info!("📭 Guild {}: cola vacía", self.guild_id);
                self.notify(StatusUpdate::QueueEmpty {
                    guild_id: self.guild_id,
                });
            }
        }
    }

    fn start(&mut self, track: Track) {
        let paused = self.policy.auto_pause && self.listeners == Some(0);
        self.state = if paused {
            SessionState::Paused(PauseReason::NoListeners)
        } else {
            SessionState::Playing
        };

        self.recent.push_back(track.identifier.clone());
        if self.recent.len() > MAX_RECENT {
            self.recent.pop_front();
        }

        let command = NodeCommand::Play {
            guild_id: self.guild_id,
            track: track.encoded.clone(),
            start: Duration::ZERO,
            paused,
        };
        debug!("🎵 Guild {}: iniciando {}", self.guild_id, track.title);
        self.current = Some(track);
        self.position = Duration::ZERO;
        self.send(command);
    }

    async fn recommend(&self, seed: Option<&Track>) -> Option<Track> {
        if !self.policy.auto_queue {
            return None;
        }
        let (Some(recommender), Some(seed)) = (&self.ctx.recommender, seed) else {
            return None;
        };

        let recent: Vec<String> = self.recent.iter().cloned().collect();
        let track = recommender.recommend(seed, &recent).await?;
        info!("🤖 Guild {}: autoqueue → {}", self.guild_id, track.title);
        Some(track)
    }

    async fn record_history(&self) {
        if !self.policy.history {
            return;
        }
        let Some(track) = self.current.clone() else {
            return;
        };
        if let Err(e) = self.ctx.store.append_history(self.guild_id, track).await {
            warn!("Guild {}: no se pudo guardar el historial: {}", self.guild_id, e);
        }
    }

    fn record_failure(&mut self, cause: String) {
        let Some(track) = self.current.clone() else {
            return;
        };
        warn!(
            "⚠️ Guild {}: falló {}: {}",
            self.guild_id, track.title, cause
        );
        self.notify(StatusUpdate::TrackFailed {
            guild_id: self.guild_id,
            title: track.title.clone(),
            cause,
        });
        self.failed.push_back(track);
        if self.failed.len() > MAX_FAILED {
            self.failed.pop_front();
        }
    }

    async fn save_resume_point(&self) {
        let point = self.current.clone().map(|track| ResumePoint {
            track,
            position: self.position,
            paused: matches!(self.state, SessionState::Paused(_)),
            upcoming: self.queue.tracks(),
        });
        if let Err(e) = self.ctx.store.save_resume_point(self.guild_id, point).await {
            warn!("Guild {}: no se pudo guardar la posición: {}", self.guild_id, e);
        }
    }

    fn teardown(&mut self, status: Option<StatusUpdate>) {
        if self.state == SessionState::Destroyed {
            return;
        }

        if let Err(e) = self.dispatch(NodeCommand::Destroy {
            guild_id: self.guild_id,
        }) {
            debug!("Guild {}: destroy no enviado: {}", self.guild_id, e);
        }
        self.ctx.pool.release(self.guild_id, &self.route);

        self.state = SessionState::Destroyed;
        self.current = None;
        self.queue.clear();
        self.idle_deadline = None;
        info!("👋 Guild {}: sesión destruida", self.guild_id);

        if let Some(status) = status {
            self.notify(status);
        }
    }

    fn refresh_idle_timer(&mut self) {
        let idle = self.state == SessionState::Idle
            && self.current.is_none()
            && self.queue.is_empty()
            && self.policy.allows_auto_leave();

        if !idle {
            self.idle_deadline = None;
        } else if self.idle_deadline.is_none() {
            debug!(
                "Guild {}: auto-leave en {:?}",
                self.guild_id, self.ctx.auto_leave_grace
            );
            self.idle_deadline = Some(Instant::now() + self.ctx.auto_leave_grace);
        }
    }

    fn is_current(&self, encoded: &str) -> bool {
        self.current.as_ref().is_some_and(|t| t.matches(encoded))
    }

    fn dispatch(&self, command: NodeCommand) -> MusicResult<()> {
        self.ctx.pool.dispatch(&self.node, command)
    }

    /// Dispatch whose failure is handled by recovery (reconnect or
    /// migration): warn the guild once per outage and move on.
    fn send(&mut self, command: NodeCommand) {
        if let Err(e) = self.dispatch(command) {
            debug!("Guild {}: comando no enviado a {}: {}", self.guild_id, self.node, e);
            if !self.node_warned {
                self.node_warned = true;
                self.notify(StatusUpdate::NodeFailure {
                    guild_id: self.guild_id,
                    node: self.node.clone(),
                });
            }
        }
    }

    fn notify(&self, update: StatusUpdate) {
        if self.ctx.status.send(update).is_err() {
            debug!("Guild {}: nadie escucha los estados", self.guild_id);
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            guild_id: self.guild_id,
            node: self.node.clone(),
            state: self.state,
            current: self.current.clone(),
            position: self.position,
            queue: self.queue.tracks(),
            queue_duration: self.queue.total_duration(),
            policy: self.policy,
            volume: self.volume,
            listeners: self.listeners,
            failed: self.failed.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        audio::autoqueue::MockTrackRecommender,
        lavalink::{
            pool::tests::fake_pool,
            protocol::{IncomingMessage, OutgoingMessage, TrackEventPayload},
            transport::fake::FakeRemote,
        },
        storage::MockPolicyStore,
    };
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;
    use std::collections::HashMap;

    const GUILD: GuildId = GuildId::new(10);

    pub(crate) fn track(n: usize) -> Track {
        Track::new(
            format!("enc{n}"),
            format!("id{n}"),
            format!("Track {n}"),
            Duration::from_secs(180),
            UserId::new(1),
        )
    }

    /// Store that accepts everything and records nothing.
    pub(crate) fn quiet_store() -> MockPolicyStore {
        let mut store = MockPolicyStore::new();
        store.expect_load_policy().returning(|_| Ok(None));
        store.expect_save_policy().returning(|_, _| Ok(()));
        store.expect_append_history().returning(|_, _| Ok(()));
        store.expect_save_resume_point().returning(|_, _| Ok(()));
        store
    }

    pub(crate) fn context(
        pool: NodePool,
        store: MockPolicyStore,
        recommender: Option<MockTrackRecommender>,
    ) -> (SessionContext, flume::Receiver<StatusUpdate>) {
        let (status_tx, status_rx) = flume::unbounded();
        let ctx = SessionContext {
            pool,
            store: Arc::new(store),
            recommender: recommender.map(|r| Arc::new(r) as Arc<dyn TrackRecommender>),
            status: status_tx,
            default_policy: PlaybackPolicy::default(),
            auto_leave_grace: Duration::from_secs(300),
            max_queue_size: 100,
        };
        (ctx, status_rx)
    }

    pub(crate) async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    struct Harness {
        session: SessionHandle,
        remotes: HashMap<String, FakeRemote>,
        status: flume::Receiver<StatusUpdate>,
        closed: mpsc::UnboundedReceiver<(GuildId, u64)>,
    }

    impl Harness {
        async fn new(policy: PlaybackPolicy, store: MockPolicyStore) -> Self {
            Self::with(&["A"], policy, store, None).await
        }

        async fn with(
            nodes: &[&str],
            policy: PlaybackPolicy,
            store: MockPolicyStore,
            recommender: Option<MockTrackRecommender>,
        ) -> Self {
            let (pool, _connector, remotes) = fake_pool(nodes, &[]).await;
            let (ctx, status) = context(pool, store, recommender);
            let (closed_tx, closed) = mpsc::unbounded_channel();
            let session = PlaybackSession::spawn(GUILD, 1, nodes[0], policy, ctx, closed_tx);
            settle().await;
            Self {
                session,
                remotes,
                status,
                closed,
            }
        }

        fn node(&mut self, id: &str) -> &mut FakeRemote {
            self.remotes.get_mut(id).expect("nodo desconocido")
        }

        async fn send(&mut self, id: &str, payload: TrackEventPayload) {
            self.node(id).send(IncomingMessage::Event(payload));
            settle().await;
        }

        async fn request(&self, request: SessionRequest) -> SessionSnapshot {
            self.session.request(request).await.unwrap()
        }

        fn statuses(&self) -> Vec<StatusUpdate> {
            self.status.try_iter().collect()
        }
    }

    fn ended(n: usize, reason: TrackEndReason) -> TrackEventPayload {
        TrackEventPayload::TrackEnd {
            guild_id: "10".into(),
            track: format!("enc{n}"),
            reason,
        }
    }

    fn exception(n: usize) -> TrackEventPayload {
        TrackEventPayload::TrackException {
            guild_id: "10".into(),
            track: format!("enc{n}"),
            exception: None,
            error: Some("403".into()),
        }
    }

    fn titles(snapshot: &SessionSnapshot) -> Vec<String> {
        snapshot.queue.iter().map(|t| t.title.clone()).collect()
    }

    fn current_title(snapshot: &SessionSnapshot) -> Option<String> {
        snapshot.current.as_ref().map(|t| t.title.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_on_idle_starts_playback() {
        let mut h = Harness::new(PlaybackPolicy::default(), quiet_store()).await;

        let snapshot = h
            .request(SessionRequest::Enqueue(vec![track(1), track(2)]))
            .await;

        assert_eq!(snapshot.state, SessionState::Playing);
        assert_eq!(current_title(&snapshot).as_deref(), Some("Track 1"));
        assert_eq!(titles(&snapshot), vec!["Track 2"]);
        assert_eq!(snapshot.queue_duration, Duration::from_secs(180));
        assert_eq!(
            h.node("A").next_op().await,
            OutgoingMessage::Play {
                guild_id: "10".into(),
                track: "enc1".into(),
                start_time: 0,
                pause: false,
                no_replace: false,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn each_finished_event_advances_exactly_one_track() {
        let mut h = Harness::new(PlaybackPolicy::default(), quiet_store()).await;
        h.request(SessionRequest::Enqueue((1..=4).map(track).collect()))
            .await;

        for n in 1..=4 {
            let before = h.request(SessionRequest::Snapshot).await;
            h.send("A", ended(n, TrackEndReason::Finished)).await;
            let after = h.request(SessionRequest::Snapshot).await;

            if n < 4 {
                assert_eq!(after.queue.len(), before.queue.len() - 1);
                assert_eq!(current_title(&after), Some(format!("Track {}", n + 1)));
            } else {
                assert_eq!(after.current, None);
                assert_eq!(after.state, SessionState::Idle);
            }
        }

        // A repeated end for a track that is no longer current changes nothing.
        h.request(SessionRequest::Enqueue(vec![track(5), track(6)]))
            .await;
        h.send("A", ended(4, TrackEndReason::Finished)).await;
        let snapshot = h.request(SessionRequest::Snapshot).await;
        assert_eq!(current_title(&snapshot).as_deref(), Some("Track 5"));
        assert_eq!(titles(&snapshot), vec!["Track 6"]);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_tracks_go_to_history_when_enabled() {
        let mut store = MockPolicyStore::new();
        store.expect_save_resume_point().returning(|_, _| Ok(()));
        store
            .expect_append_history()
            .withf(|guild, track| *guild == GUILD && track.title == "Track 1")
            .times(1)
            .returning(|_, _| Ok(()));
        let policy = PlaybackPolicy {
            history: true,
            ..PlaybackPolicy::default()
        };
        let mut h = Harness::new(policy, store).await;
        h.request(SessionRequest::Enqueue(vec![track(1), track(2)]))
            .await;

        h.send("A", ended(1, TrackEndReason::Finished)).await;

        let snapshot = h.request(SessionRequest::Snapshot).await;
        assert_eq!(current_title(&snapshot).as_deref(), Some("Track 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn track_error_skips_without_history_or_replay() {
        let mut store = MockPolicyStore::new();
        store.expect_append_history().times(1).returning(|_, _| Ok(()));
        let policy = PlaybackPolicy {
            history: true,
            ..PlaybackPolicy::default()
        };
        let mut h = Harness::new(policy, store).await;
        h.request(SessionRequest::Enqueue((1..=5).map(track).collect()))
            .await;
        h.send("A", ended(1, TrackEndReason::Finished)).await;

        let before = h.request(SessionRequest::Snapshot).await;
        assert_eq!(current_title(&before).as_deref(), Some("Track 2"));
        assert_eq!(before.queue.len() + 1, 4);
        h.node("A").drain_ops();

        h.send("A", exception(2)).await;
        // The node follows an exception with a LOAD_FAILED end.
        h.send("A", ended(2, TrackEndReason::LoadFailed)).await;

        let after = h.request(SessionRequest::Snapshot).await;
        assert_eq!(current_title(&after).as_deref(), Some("Track 3"));
        assert_eq!(after.queue.len() + 1, 3);
        assert_eq!(
            after.failed.iter().map(|t| t.title.as_str()).collect::<Vec<_>>(),
            vec!["Track 2"]
        );

        let plays: Vec<_> = h
            .node("A")
            .drain_ops()
            .into_iter()
            .filter_map(|op| match op {
                OutgoingMessage::Play { track, .. } => Some(track),
                _ => None,
            })
            .collect();
        assert_eq!(plays, vec!["enc3".to_string()]);
        assert!(h.statuses().iter().any(|s| matches!(
            s,
            StatusUpdate::TrackFailed { title, .. } if title == "Track 2"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_enqueue_skip_is_deterministic() {
        let mut h = Harness::new(PlaybackPolicy::default(), quiet_store()).await;
        h.request(SessionRequest::Enqueue(vec![track(1)])).await;
        h.node("A").drain_ops();

        let session = h.session.clone();
        let (first, second, third) = tokio::join!(
            session.request(SessionRequest::Skip),
            session.request(SessionRequest::Enqueue(vec![track(7)])),
            session.request(SessionRequest::Skip),
        );
        first.unwrap();
        second.unwrap();
        third.unwrap();

        let stops = h
            .node("A")
            .drain_ops()
            .into_iter()
            .filter(|op| matches!(op, OutgoingMessage::Stop { .. }))
            .count();
        assert_eq!(stops, 1);

        h.send("A", ended(1, TrackEndReason::Stopped)).await;

        let snapshot = h.request(SessionRequest::Snapshot).await;
        assert_eq!(current_title(&snapshot).as_deref(), Some("Track 7"));
        assert!(snapshot.queue.is_empty());
        assert_eq!(snapshot.state, SessionState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_without_track_reports_no_playback() {
        let h = Harness::new(PlaybackPolicy::default(), quiet_store()).await;

        assert_eq!(
            h.session.request(SessionRequest::Skip).await,
            Err(MusicError::NoSession(GUILD))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn auto_pause_follows_listeners() {
        let mut h = Harness::new(PlaybackPolicy::default(), quiet_store()).await;
        h.request(SessionRequest::Enqueue(vec![track(1), track(2)]))
            .await;

        let paused = h.request(SessionRequest::ListenersChanged(0)).await;
        assert_eq!(paused.state, SessionState::Paused(PauseReason::NoListeners));
        assert_eq!(titles(&paused), vec!["Track 2"]);

        let resumed = h.request(SessionRequest::ListenersChanged(2)).await;
        assert_eq!(resumed.state, SessionState::Playing);

        let statuses = h.statuses();
        assert!(statuses.contains(&StatusUpdate::AutoPaused { guild_id: GUILD }));
        assert!(statuses.contains(&StatusUpdate::AutoResumed { guild_id: GUILD }));

        // A user pause is not undone by listeners coming back.
        h.request(SessionRequest::Pause).await;
        let still = h.request(SessionRequest::ListenersChanged(3)).await;
        assert_eq!(still.state, SessionState::Paused(PauseReason::User));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_leave_destroys_idle_session_after_grace() {
        let policy = PlaybackPolicy {
            auto_leave: true,
            ..PlaybackPolicy::default()
        };
        let mut h = Harness::new(policy, quiet_store()).await;
        h.request(SessionRequest::Enqueue(vec![track(1)])).await;
        h.send("A", ended(1, TrackEndReason::Finished)).await;

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(!h.session.is_closed());

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(h.closed.recv().await, Some((GUILD, 1)));
        assert!(h.session.is_closed());
        assert!(h.statuses().contains(&StatusUpdate::Left { guild_id: GUILD }));
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_cancels_pending_auto_leave() {
        let policy = PlaybackPolicy {
            auto_leave: true,
            ..PlaybackPolicy::default()
        };
        let h = Harness::new(policy, quiet_store()).await;

        tokio::time::sleep(Duration::from_secs(200)).await;
        h.request(SessionRequest::Enqueue(vec![track(1)])).await;
        tokio::time::sleep(Duration::from_secs(200)).await;

        let snapshot = h.request(SessionRequest::Snapshot).await;
        assert_eq!(snapshot.state, SessionState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn twenty_four_seven_never_leaves() {
        let policy = PlaybackPolicy {
            auto_leave: true,
            twenty_four_seven: true,
            ..PlaybackPolicy::default()
        };
        let h = Harness::new(policy, quiet_store()).await;

        for _ in 0..24 {
            tokio::time::sleep(Duration::from_secs(300)).await;
        }

        let snapshot = h.request(SessionRequest::Snapshot).await;
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(!h.session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn set_policy_is_persisted() {
        let mut store = MockPolicyStore::new();
        store
            .expect_save_policy()
            .withf(|guild, policy| *guild == GUILD && policy.twenty_four_seven)
            .times(1)
            .returning(|_, _| Ok(()));
        let h = Harness::new(PlaybackPolicy::default(), store).await;

        let snapshot = h
            .request(SessionRequest::SetPolicy(PolicyPatch {
                twenty_four_seven: Some(true),
                ..PolicyPatch::default()
            }))
            .await;

        assert!(snapshot.policy.twenty_four_seven);
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failures_do_not_stop_playback() {
        let mut store = MockPolicyStore::new();
        store
            .expect_append_history()
            .returning(|_, _| Err(MusicError::Persistence("disco lleno".into())));
        store
            .expect_save_resume_point()
            .returning(|_, _| Err(MusicError::Persistence("disco lleno".into())));
        let policy = PlaybackPolicy {
            history: true,
            ..PlaybackPolicy::default()
        };
        let mut h = Harness::new(policy, store).await;
        h.request(SessionRequest::Enqueue(vec![track(1), track(2)]))
            .await;

        h.send("A", ended(1, TrackEndReason::Finished)).await;

        let snapshot = h.request(SessionRequest::Snapshot).await;
        assert_eq!(current_title(&snapshot).as_deref(), Some("Track 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_queue_asks_recommender_when_queue_runs_dry() {
        let mut recommender = MockTrackRecommender::new();
        recommender
            .expect_recommend()
            .withf(|seed, recent| seed.title == "Track 1" && recent.contains(&"id1".to_string()))
            .times(1)
            .returning(|_, _| Some(track(9)));
        let policy = PlaybackPolicy {
            auto_queue: true,
            ..PlaybackPolicy::default()
        };
        let mut h = Harness::with(&["A"], policy, quiet_store(), Some(recommender)).await;
        h.request(SessionRequest::Enqueue(vec![track(1)])).await;

        h.send("A", ended(1, TrackEndReason::Finished)).await;

        let snapshot = h.request(SessionRequest::Snapshot).await;
        assert_eq!(current_title(&snapshot).as_deref(), Some("Track 9"));
    }

    #[tokio::test(start_paused = true)]
    async fn migration_resumes_on_new_node_with_single_warning() {
        let mut h = Harness::with(&["A", "B"], PlaybackPolicy::default(), quiet_store(), None).await;
        let voice = VoiceCredentials {
            session_id: "s".into(),
            token: "t".into(),
            endpoint: "e".into(),
        };
        h.request(SessionRequest::VoiceUpdate(voice)).await;
        h.request(SessionRequest::Enqueue(vec![track(1), track(2)]))
            .await;
        h.node("A").send(IncomingMessage::PlayerUpdate {
            guild_id: "10".into(),
            state: crate::lavalink::protocol::PlayerUpdateState {
                time: 0,
                position: 42_000,
                connected: true,
            },
        });
        settle().await;

        h.node("A").close();
        settle().await;

        let snapshot = h.request(SessionRequest::Snapshot).await;
        assert_eq!(snapshot.node, "B");
        assert_eq!(current_title(&snapshot).as_deref(), Some("Track 1"));
        assert_eq!(titles(&snapshot), vec!["Track 2"]);

        let ops = h.node("B").drain_ops();
        assert!(matches!(ops[0], OutgoingMessage::VoiceUpdate { .. }));
        assert_eq!(
            ops[1],
            OutgoingMessage::Play {
                guild_id: "10".into(),
                track: "enc1".into(),
                start_time: 42_000,
                pause: false,
                no_replace: false,
            }
        );

        let warnings: Vec<_> = h
            .statuses()
            .into_iter()
            .filter(|s| matches!(s, StatusUpdate::PlaybackInterrupted { .. }))
            .collect();
        assert_eq!(
            warnings,
            vec![StatusUpdate::PlaybackInterrupted {
                guild_id: GUILD,
                from: "A".into(),
                to: Some("B".into()),
            }]
        );

        // Events keep flowing from the new node only.
        h.send("B", ended(1, TrackEndReason::Finished)).await;
        let snapshot = h.request(SessionRequest::Snapshot).await;
        assert_eq!(current_title(&snapshot).as_deref(), Some("Track 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_skip_completes_on_the_new_node() {
        let mut h = Harness::with(&["A", "B"], PlaybackPolicy::default(), quiet_store(), None).await;
        h.request(SessionRequest::Enqueue(vec![track(1), track(2)]))
            .await;
        h.request(SessionRequest::Skip).await;

        h.node("A").close();
        settle().await;

        let snapshot = h.request(SessionRequest::Snapshot).await;
        assert_eq!(current_title(&snapshot).as_deref(), Some("Track 2"));
        assert!(snapshot.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn leave_destroys_player_and_closes_session() {
        let mut h = Harness::new(PlaybackPolicy::default(), quiet_store()).await;
        h.request(SessionRequest::Enqueue(vec![track(1)])).await;
        h.node("A").drain_ops();

        let snapshot = h.request(SessionRequest::Leave).await;
        assert_eq!(snapshot.state, SessionState::Destroyed);

        assert_eq!(
            h.node("A").next_op().await,
            OutgoingMessage::Destroy {
                guild_id: "10".into()
            }
        );
        assert_eq!(h.closed.recv().await, Some((GUILD, 1)));
        assert_eq!(
            h.session.request(SessionRequest::Snapshot).await,
            Err(MusicError::SessionClosed(GUILD))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn queue_commands_validate_indices() {
        let h = Harness::new(PlaybackPolicy::default(), quiet_store()).await;
        h.request(SessionRequest::Enqueue((1..=4).map(track).collect()))
            .await;

        assert_eq!(
            h.session.request(SessionRequest::Remove(9)).await,
            Err(MusicError::IndexOutOfRange(9))
        );

        let snapshot = h.request(SessionRequest::Move { from: 2, to: 0 }).await;
        assert_eq!(titles(&snapshot), vec!["Track 4", "Track 2", "Track 3"]);

        let snapshot = h.request(SessionRequest::Clear).await;
        assert!(snapshot.queue.is_empty());
        assert_eq!(current_title(&snapshot).as_deref(), Some("Track 1"));

        let snapshot = h.request(SessionRequest::Volume(5000)).await;
        assert_eq!(snapshot.volume, 1000);
    }
}
