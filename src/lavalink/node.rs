//! One managed connection to one Lavalink node.
//!
//! The connection is an actor task. Other components only see a
//! [`NodeHandle`]: its health is published on a watch channel and commands
//! go through an mpsc queue to the actor, which owns the link.

use serenity::model::id::GuildId;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, NodeDescriptor},
    error::{MusicError, MusicResult},
    lavalink::{
        backoff::Backoff,
        protocol::{parse_guild, IncomingMessage, TrackEndReason, TrackEventPayload},
        transport::{Connector, InboundFrame, NodeLink, OutboundFrame},
        ClientInfo, NodeCommand,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Connecting,
    Ready,
    /// Heartbeats stopped arriving. Any inbound frame brings the node back
    /// to Ready; too many missed intervals drop the link.
    Degraded,
    Reconnecting,
    /// Terminal. Reached after exhausting retries or on shutdown.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeHealth {
    pub state: NodeState,
    /// Penalty score from the last stats frame; lower is better.
    pub load: u64,
    pub last_heartbeat: Option<Instant>,
    pub retries: u32,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            state: NodeState::Disconnected,
            load: 0,
            last_heartbeat: None,
            retries: 0,
        }
    }
}

/// Timing shared by every node connection.
#[derive(Debug, Clone, Copy)]
pub struct NodeSettings {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub max_backoff: Duration,
}

impl NodeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            max_missed_heartbeats: config.max_missed_heartbeats,
            max_backoff: config.max_backoff(),
        }
    }
}

/// Something a node reported, in the order the node produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Ready,
    StatsUpdated {
        load: u64,
    },
    /// The link dropped; the node is now Reconnecting.
    NodeDisconnected,
    /// The node gave up reconnecting.
    NodeClosed,
    TrackStarted {
        guild_id: GuildId,
        track: String,
    },
    TrackEnded {
        guild_id: GuildId,
        track: String,
        reason: TrackEndReason,
    },
    /// Exceptions and stuck tracks.
    TrackError {
        guild_id: GuildId,
        track: String,
        cause: String,
    },
    PlayerUpdated {
        guild_id: GuildId,
        position: Duration,
    },
    VoiceSocketClosed {
        guild_id: GuildId,
        code: u16,
        reason: String,
    },
}

impl NodeEvent {
    pub fn guild_id(&self) -> Option<GuildId> {
        match self {
            NodeEvent::TrackStarted { guild_id, .. }
            | NodeEvent::TrackEnded { guild_id, .. }
            | NodeEvent::TrackError { guild_id, .. }
            | NodeEvent::PlayerUpdated { guild_id, .. }
            | NodeEvent::VoiceSocketClosed { guild_id, .. } => Some(*guild_id),
            _ => None,
        }
    }
}

/// A [`NodeEvent`] tagged with the node that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEnvelope {
    pub node: String,
    pub event: NodeEvent,
}

enum Control {
    Connect(oneshot::Sender<MusicResult<()>>),
}

/// Cloneable view of a node connection.
#[derive(Clone)]
pub struct NodeHandle {
    descriptor: Arc<NodeDescriptor>,
    health: watch::Receiver<NodeHealth>,
    control: mpsc::UnboundedSender<Control>,
    commands: mpsc::UnboundedSender<NodeCommand>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("identifier", &self.descriptor.identifier)
            .field("health", &*self.health.borrow())
            .finish()
    }
}

impl NodeHandle {
    /// Spawns the actor. The node stays Disconnected until [`connect`] is
    /// called.
    ///
    /// [`connect`]: NodeHandle::connect
    pub fn spawn(
        descriptor: NodeDescriptor,
        client: ClientInfo,
        settings: NodeSettings,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<NodeEnvelope>,
        cancel: CancellationToken,
    ) -> Self {
        let descriptor = Arc::new(descriptor);
        let (health_tx, health_rx) = watch::channel(NodeHealth::default());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let actor = NodeActor {
            backoff: Backoff::new(
                descriptor.retry_delay(),
                settings.max_backoff,
                descriptor.retry_amount,
            ),
            descriptor: descriptor.clone(),
            client,
            settings,
            connector,
            health: health_tx,
            control: control_rx,
            commands: commands_rx,
            events,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run());

        Self {
            descriptor,
            health: health_rx,
            control: control_tx,
            commands: commands_tx,
            cancel,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.descriptor.identifier
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> NodeState {
        self.health.borrow().state
    }

    pub fn load(&self) -> u64 {
        self.health.borrow().load
    }

    pub fn health(&self) -> NodeHealth {
        self.health.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == NodeState::Ready
    }

    /// Opens the link, answering with the outcome of the first attempt.
    ///
    /// A failed first attempt leaves the node Reconnecting in the
    /// background. A Closed node is never revived.
    pub async fn connect(&self) -> MusicResult<()> {
        let closed = || MusicError::NodeClosed {
            node: self.descriptor.identifier.clone(),
        };

        if self.state() == NodeState::Closed {
            return Err(closed());
        }

        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Connect(tx))
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }

    /// Queues a command for the node. Any state but Ready, Closed included,
    /// fails with `NotReady`.
    pub fn dispatch(&self, command: NodeCommand) -> MusicResult<()> {
        if self.state() != NodeState::Ready {
            return Err(MusicError::NotReady {
                node: self.descriptor.identifier.clone(),
            });
        }
        self.commands.send(command).map_err(|_| MusicError::NodeClosed {
            node: self.descriptor.identifier.clone(),
        })
    }

    /// Waits until the node reaches `state`, or gives up after `timeout`.
    pub async fn wait_for(&self, state: NodeState, timeout: Duration) -> bool {
        let mut health = self.health.clone();
        let reached = matches!(
            tokio::time::timeout(timeout, health.wait_for(|h| h.state == state)).await,
            Ok(Ok(_))
        );
        reached
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

enum LinkEnd {
    Lost,
    Cancelled,
}

struct NodeActor {
    descriptor: Arc<NodeDescriptor>,
    client: ClientInfo,
    settings: NodeSettings,
    connector: Arc<dyn Connector>,
    health: watch::Sender<NodeHealth>,
    control: mpsc::UnboundedReceiver<Control>,
    commands: mpsc::UnboundedReceiver<NodeCommand>,
    events: mpsc::UnboundedSender<NodeEnvelope>,
    cancel: CancellationToken,
    backoff: Backoff,
}

impl NodeActor {
    async fn run(mut self) {
        let first = tokio::select! {
            _ = self.cancel.cancelled() => None,
            control = self.control.recv() => control,
        };
        let Some(Control::Connect(reply)) = first else {
            self.set_state(NodeState::Closed);
            return;
        };

        let mut reply = Some(reply);
        let mut state = NodeState::Connecting;

        loop {
            self.set_state(state);

            match self.attempt().await {
                Some(Ok(link)) => {
                    self.backoff.reset();
                    self.health.send_modify(|h| {
                        h.state = NodeState::Ready;
                        h.retries = 0;
                        h.last_heartbeat = Some(Instant::now());
                    });
                    info!("🔗 [{}] Nodo listo", self.descriptor.identifier);
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                    self.emit(NodeEvent::Ready);

                    match self.drive(link).await {
                        LinkEnd::Cancelled => break,
                        LinkEnd::Lost => {
                            self.set_state(NodeState::Reconnecting);
                            warn!(
                                "🔌 [{}] Conexión perdida, reconectando",
                                self.descriptor.identifier
                            );
                            self.emit(NodeEvent::NodeDisconnected);
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!("❌ [{}] Intento de conexión fallido: {}", self.descriptor.identifier, e);
                    self.set_state(NodeState::Reconnecting);
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Err(e));
                    }
                }
                None => break,
            }

            let Some(delay) = self.backoff.next() else {
                self.set_state(NodeState::Closed);
                error!(
                    "💀 [{}] Reintentos agotados ({}), nodo cerrado",
                    self.descriptor.identifier, self.descriptor.retry_amount
                );
                self.emit(NodeEvent::NodeClosed);
                return;
            };

            let retries = self.backoff.attempts();
            self.health.send_modify(|h| h.retries = retries);
            debug!(
                "⏳ [{}] Reintento {}/{} en {:?}",
                self.descriptor.identifier, retries, self.descriptor.retry_amount, delay
            );

            if !self.pause(delay).await {
                break;
            }
            state = NodeState::Reconnecting;
        }

        self.set_state(NodeState::Closed);
        info!("👋 [{}] Nodo apagado", self.descriptor.identifier);
    }

    /// One connect attempt bounded by the connect timeout. `None` means the
    /// actor was cancelled.
    async fn attempt(&self) -> Option<MusicResult<NodeLink>> {
        let connect = self.connector.connect(&self.descriptor, &self.client);
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = tokio::time::timeout(self.settings.connect_timeout, connect) => {
                Some(result.unwrap_or_else(|_| Err(MusicError::Transport {
                    node: self.descriptor.identifier.clone(),
                    message: format!("timeout tras {:?}", self.settings.connect_timeout),
                })))
            }
        }
    }

    /// Sleeps between attempts while still answering control messages.
    /// Returns false if cancelled.
    async fn pause(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(control) = self.control.recv() => self.answer(control),
            }
        }
    }

    fn answer(&self, control: Control) {
        let Control::Connect(reply) = control;
        let result = match self.health.borrow().state {
            NodeState::Ready => Ok(()),
            NodeState::Closed => Err(MusicError::NodeClosed {
                node: self.descriptor.identifier.clone(),
            }),
            _ => Err(MusicError::NotReady {
                node: self.descriptor.identifier.clone(),
            }),
        };
        let _ = reply.send(result);
    }

    async fn drive(&mut self, mut link: NodeLink) -> LinkEnd {
        // Commands queued while the node was not Ready target a player that
        // no longer exists.
        while let Ok(stale) = self.commands.try_recv() {
            debug!(
                "[{}] Descartado comando pendiente para guild {}",
                self.descriptor.identifier,
                stale.guild_id()
            );
        }

        let period = self.settings.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed = 0u32;
        // The handshake itself counts as the first beat.
        let mut alive = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return LinkEnd::Cancelled,

                Some(control) = self.control.recv() => self.answer(control),

                Some(command) = self.commands.recv() => {
                    let frame = OutboundFrame::Message(command.into_message());
                    if link.outbound.send(frame).is_err() {
                        return LinkEnd::Lost;
                    }
                }

                frame = link.inbound.recv() => {
                    let Some(frame) = frame else {
                        return LinkEnd::Lost;
                    };
                    alive = true;
                    if std::mem::take(&mut missed) > 0 {
                        self.set_state(NodeState::Ready);
                        info!("💚 [{}] Heartbeat recuperado", self.descriptor.identifier);
                    }
                    self.health.send_modify(|h| h.last_heartbeat = Some(Instant::now()));
                    match frame {
                        InboundFrame::Message(msg) => self.handle_message(msg),
                        InboundFrame::Heartbeat => {}
                        InboundFrame::Closed { code, reason } => {
                            warn!(
                                "[{}] WebSocket cerrado por el nodo ({:?}): {}",
                                self.descriptor.identifier, code, reason
                            );
                            return LinkEnd::Lost;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if alive {
                        alive = false;
                    } else {
                        missed += 1;
                        debug!(
                            "💓 [{}] Heartbeat perdido ({}/{})",
                            self.descriptor.identifier, missed, self.settings.max_missed_heartbeats
                        );
                        self.set_state(NodeState::Degraded);
                        if missed >= self.settings.max_missed_heartbeats {
                            warn!(
                                "🐢 [{}] Sin respuesta en {} intervalos",
                                self.descriptor.identifier, missed
                            );
                            return LinkEnd::Lost;
                        }
                    }
                    if link.outbound.send(OutboundFrame::Ping).is_err() {
                        return LinkEnd::Lost;
                    }
                }
            }
        }
    }

    fn handle_message(&self, msg: IncomingMessage) {
        let node = &self.descriptor.identifier;
        match msg {
            IncomingMessage::Ready { resumed, session_id } => {
                debug!("[{}] Sesión {} (resumed: {})", node, session_id, resumed);
            }
            IncomingMessage::Stats(stats) => {
                let load = stats.penalty();
                self.health.send_modify(|h| h.load = load);
                self.emit(NodeEvent::StatsUpdated { load });
            }
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                if let Some(guild_id) = parse_guild(&guild_id) {
                    self.emit(NodeEvent::PlayerUpdated {
                        guild_id,
                        position: Duration::from_millis(state.position),
                    });
                }
            }
            IncomingMessage::Event(payload) => {
                let Some(guild_id) = parse_guild(payload.guild_id()) else {
                    warn!("[{}] Evento con guild inválido: {:?}", node, payload);
                    return;
                };
                let event = match payload {
                    TrackEventPayload::TrackStart { track, .. } => {
                        NodeEvent::TrackStarted { guild_id, track }
                    }
                    TrackEventPayload::TrackEnd { track, reason, .. } => NodeEvent::TrackEnded {
                        guild_id,
                        track,
                        reason,
                    },
                    TrackEventPayload::TrackException {
                        track,
                        exception,
                        error,
                        ..
                    } => {
                        let cause = exception
                            .and_then(|e| e.message.or(e.cause))
                            .or(error)
                            .unwrap_or_else(|| "error desconocido".to_string());
                        NodeEvent::TrackError {
                            guild_id,
                            track,
                            cause,
                        }
                    }
                    TrackEventPayload::TrackStuck {
                        track, threshold_ms, ..
                    } => NodeEvent::TrackError {
                        guild_id,
                        track,
                        cause: format!("track atascado más de {} ms", threshold_ms),
                    },
                    TrackEventPayload::WebSocketClosed { code, reason, .. } => {
                        NodeEvent::VoiceSocketClosed {
                            guild_id,
                            code,
                            reason,
                        }
                    }
                };
                self.emit(event);
            }
        }
    }

    fn set_state(&self, state: NodeState) {
        self.health.send_if_modified(|h| {
            if h.state == state {
                return false;
            }
            debug!("[{}] {:?} → {:?}", self.descriptor.identifier, h.state, state);
            h.state = state;
            true
        });
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(NodeEnvelope {
            node: self.descriptor.identifier.clone(),
            event,
        });
    }
}
