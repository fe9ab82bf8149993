//! Node pool: selection, event routing and session migration.

use serenity::model::id::{GuildId, UserId};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    audio::track::Track,
    cache::SearchCache,
    config::Config,
    error::{MusicError, MusicResult},
    lavalink::{
        node::{NodeEnvelope, NodeEvent, NodeHandle, NodeSettings, NodeState},
        rest::{search_identifier, RestClient},
        transport::Connector,
        ClientInfo, NodeCommand,
    },
};

/// What the pool tells a session.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolNotice {
    /// A guild event from the node the session is assigned to.
    Event(NodeEvent),
    /// The session now lives on `to` and must re-establish playback there.
    Migrated { from: String, to: String },
    /// The session's node came back after a disconnect with no alternative.
    NodeRecovered { node: String },
    /// The session's node closed and nothing could take over.
    NodeLost { node: String },
}

enum RouterRequest {
    Assign {
        guild_id: GuildId,
        node: String,
        session: mpsc::UnboundedSender<PoolNotice>,
    },
    Release {
        guild_id: GuildId,
        session: mpsc::UnboundedSender<PoolNotice>,
    },
    Lookup {
        guild_id: GuildId,
        reply: oneshot::Sender<Option<String>>,
    },
}

struct PoolInner {
    nodes: Vec<NodeHandle>,
    router: mpsc::UnboundedSender<RouterRequest>,
    rest: RestClient,
    search_cache: SearchCache,
    cancel: CancellationToken,
}

/// The fixed set of node connections, in configuration order.
#[derive(Clone)]
pub struct NodePool {
    inner: Arc<PoolInner>,
}

impl NodePool {
    /// Spawns one connection per configured node plus the router, then
    /// connects every node. A node that fails to connect keeps retrying in
    /// the background and is simply not selectable meanwhile.
    pub async fn start(config: &Config, connector: Arc<dyn Connector>) -> MusicResult<Self> {
        let client = ClientInfo {
            user_id: UserId::new(config.client_id),
            client_name: config.bot_name.clone(),
        };
        let settings = NodeSettings::from_config(config);
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let nodes: Vec<NodeHandle> = config
            .nodes
            .iter()
            .map(|descriptor| {
                NodeHandle::spawn(
                    descriptor.clone(),
                    client.clone(),
                    settings,
                    connector.clone(),
                    events_tx.clone(),
                    cancel.child_token(),
                )
            })
            .collect();
        drop(events_tx);

        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let router = Router {
            nodes: nodes.clone(),
            guilds: HashMap::new(),
            events: events_rx,
            requests: router_rx,
            cancel: cancel.clone(),
        };
        tokio::spawn(router.run());

        let pool = Self {
            inner: Arc::new(PoolInner {
                nodes,
                router: router_tx,
                rest: RestClient::new(settings.connect_timeout)?,
                search_cache: SearchCache::new(512, config.search_cache_ttl()),
                cancel,
            }),
        };

        let attempts = pool.inner.nodes.iter().map(|node| async move {
            if let Err(e) = node.connect().await {
                warn!("⚠️ [{}] No disponible al iniciar: {}", node.identifier(), e);
            }
        });
        futures::future::join_all(attempts).await;

        let ready = pool.inner.nodes.iter().filter(|n| n.is_ready()).count();
        info!(
            "🎛️ Pool iniciado: {}/{} nodos listos",
            ready,
            pool.inner.nodes.len()
        );

        Ok(pool)
    }

    /// The Ready node with the lowest load. Ties go to the node listed
    /// first in the configuration.
    pub fn select_node(&self) -> MusicResult<NodeHandle> {
        pick(&self.inner.nodes, None)
            .cloned()
            .ok_or(MusicError::NoAvailableNode)
    }

    pub fn node(&self, identifier: &str) -> Option<NodeHandle> {
        self.inner
            .nodes
            .iter()
            .find(|n| n.identifier() == identifier)
            .cloned()
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        &self.inner.nodes
    }

    /// Sends a command to a node by identifier.
    pub fn dispatch(&self, node: &str, command: NodeCommand) -> MusicResult<()> {
        self.node(node)
            .ok_or_else(|| MusicError::NodeClosed {
                node: node.to_string(),
            })?
            .dispatch(command)
    }

    /// Routes `node`'s events for `guild_id` to `session` from now on.
    pub fn assign(
        &self,
        guild_id: GuildId,
        node: &str,
        session: mpsc::UnboundedSender<PoolNotice>,
    ) {
        let _ = self.inner.router.send(RouterRequest::Assign {
            guild_id,
            node: node.to_string(),
            session,
        });
    }

    /// Stops routing `guild_id` to `session`. An assignment that already
    /// belongs to a newer session of the guild is left alone.
    pub fn release(&self, guild_id: GuildId, session: &mpsc::UnboundedSender<PoolNotice>) {
        let _ = self.inner.router.send(RouterRequest::Release {
            guild_id,
            session: session.clone(),
        });
    }

    /// Node currently serving `guild_id`, as the router sees it.
    pub async fn assigned_node(&self, guild_id: GuildId) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .router
            .send(RouterRequest::Lookup { guild_id, reply })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Resolves a URL or search text into tracks through a Ready node.
    pub async fn load_tracks(&self, query: &str, requester: UserId) -> MusicResult<Vec<Track>> {
        let identifier = search_identifier(query);

        if let Some(tracks) = self.inner.search_cache.get(&identifier) {
            debug!("⚡ Cache hit: {}", identifier);
            return Ok(with_requester(tracks, requester));
        }

        let node = self.select_node()?;
        let tracks = self
            .inner
            .rest
            .load_tracks(node.descriptor(), &identifier)
            .await?
            .into_tracks(query, requester)?;

        self.inner.search_cache.insert(identifier, tracks.clone());
        Ok(tracks)
    }

    pub fn search_cache(&self) -> &SearchCache {
        &self.inner.search_cache
    }

    /// Waits until at least one node is Ready.
    pub async fn wait_for_any_ready(&self, timeout: Duration) -> bool {
        let waits = self
            .inner
            .nodes
            .iter()
            .map(|n| Box::pin(n.wait_for(NodeState::Ready, timeout)));
        let mut pending: Vec<_> = waits.collect();
        while !pending.is_empty() {
            let (ready, _, rest) = futures::future::select_all(pending).await;
            if ready {
                return true;
            }
            pending = rest;
        }
        false
    }

    /// Stops the router and every node connection.
    pub fn shutdown(&self) {
        info!("🛑 Apagando pool de nodos");
        self.inner.cancel.cancel();
    }
}

fn with_requester(tracks: Vec<Track>, requester: UserId) -> Vec<Track> {
    tracks
        .into_iter()
        .map(|t| t.requested_by(requester))
        .collect()
}

fn pick<'a>(nodes: &'a [NodeHandle], exclude: Option<&str>) -> Option<&'a NodeHandle> {
    nodes
        .iter()
        .filter(|n| n.is_ready() && Some(n.identifier()) != exclude)
        .min_by_key(|n| n.load())
}

struct Assignment {
    node: String,
    session: mpsc::UnboundedSender<PoolNotice>,
    /// Waiting for a node to become Ready after a disconnect.
    stranded: bool,
}

struct Router {
    nodes: Vec<NodeHandle>,
    guilds: HashMap<GuildId, Assignment>,
    events: mpsc::UnboundedReceiver<NodeEnvelope>,
    requests: mpsc::UnboundedReceiver<RouterRequest>,
    cancel: CancellationToken,
}

impl Router {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(request) = self.requests.recv() => self.handle_request(request),
                envelope = self.events.recv() => match envelope {
                    Some(envelope) => self.handle_event(envelope),
                    None => break,
                },
            }
        }
        debug!("Router del pool detenido");
    }

    fn handle_request(&mut self, request: RouterRequest) {
        match request {
            RouterRequest::Assign {
                guild_id,
                node,
                session,
            } => {
                let state = self
                    .nodes
                    .iter()
                    .find(|n| n.identifier() == node)
                    .map(|n| n.state());
                debug!("📌 Guild {} asignada al nodo {}", guild_id, node);
                self.guilds.insert(
                    guild_id,
                    Assignment {
                        node: node.clone(),
                        session,
                        stranded: false,
                    },
                );
                // The node may have dropped between selection and now.
                if state != Some(NodeState::Ready) {
                    let closed = state.map_or(true, |s| s == NodeState::Closed);
                    self.relocate(guild_id, &node, closed);
                }
            }
            RouterRequest::Release { guild_id, session } => {
                match self.guilds.get(&guild_id) {
                    Some(a) if a.session.same_channel(&session) => {
                        self.guilds.remove(&guild_id);
                        debug!("📤 Guild {} liberada", guild_id);
                    }
                    Some(_) => debug!("Guild {}: liberación obsoleta ignorada", guild_id),
                    None => {}
                }
            }
            RouterRequest::Lookup { guild_id, reply } => {
                let _ = reply.send(self.guilds.get(&guild_id).map(|a| a.node.clone()));
            }
        }
    }

    fn handle_event(&mut self, envelope: NodeEnvelope) {
        let NodeEnvelope { node, event } = envelope;

        if let Some(guild_id) = event.guild_id() {
            match self.guilds.get(&guild_id) {
                Some(assignment) if assignment.node == node => {
                    if assignment.session.send(PoolNotice::Event(event)).is_err() {
                        self.guilds.remove(&guild_id);
                    }
                }
                _ => debug!(
                    "🗑️ Evento obsoleto de {} para guild {}: {:?}",
                    node, guild_id, event
                ),
            }
            return;
        }

        match event {
            NodeEvent::Ready => self.on_node_ready(&node),
            NodeEvent::NodeDisconnected => self.on_node_lost(&node, false),
            NodeEvent::NodeClosed => {
                self.on_node_lost(&node, true);
                if self.nodes.iter().all(|n| n.state() == NodeState::Closed) {
                    error!(
                        "🚨 Todos los nodos están cerrados; el servicio de audio no está disponible hasta intervención manual"
                    );
                }
            }
            _ => {}
        }
    }

    fn on_node_lost(&mut self, node: &str, closed: bool) {
        let affected: Vec<GuildId> = self
            .guilds
            .iter()
            .filter(|(_, a)| a.node == node)
            .map(|(guild_id, _)| *guild_id)
            .collect();

        if !affected.is_empty() {
            warn!(
                "🔀 Nodo {} {}: migrando {} sesiones",
                node,
                if closed { "cerrado" } else { "desconectado" },
                affected.len()
            );
        }

        for guild_id in affected {
            self.relocate(guild_id, node, closed);
        }
    }

    /// Moves one guild off `from`. Without an alternative, a closed node
    /// loses the guild and a disconnected one keeps it stranded.
    fn relocate(&mut self, guild_id: GuildId, from: &str, closed: bool) {
        let target = pick(&self.nodes, Some(from)).map(|n| n.identifier().to_string());
        let Some(assignment) = self.guilds.get_mut(&guild_id) else {
            return;
        };

        let notice = match target {
            Some(to) => {
                info!("➡️ Guild {}: {} → {}", guild_id, from, to);
                assignment.node = to.clone();
                assignment.stranded = false;
                PoolNotice::Migrated {
                    from: from.to_string(),
                    to,
                }
            }
            None if closed => {
                warn!("💥 Guild {}: sin nodo alternativo tras cerrar {}", guild_id, from);
                let notice = PoolNotice::NodeLost {
                    node: from.to_string(),
                };
                if let Some(assignment) = self.guilds.remove(&guild_id) {
                    let _ = assignment.session.send(notice);
                }
                return;
            }
            None => {
                debug!("⏸️ Guild {}: esperando a que {} se recupere", guild_id, from);
                assignment.stranded = true;
                return;
            }
        };

        if assignment.session.send(notice).is_err() {
            self.guilds.remove(&guild_id);
        }
    }

    fn on_node_ready(&mut self, node: &str) {
        let stranded: Vec<(GuildId, String)> = self
            .guilds
            .iter()
            .filter(|(_, a)| a.stranded)
            .map(|(guild_id, a)| (*guild_id, a.node.clone()))
            .collect();

        for (guild_id, previous) in stranded {
            let Some(assignment) = self.guilds.get_mut(&guild_id) else {
                continue;
            };
            assignment.stranded = false;

            let notice = if previous == node {
                info!("✅ Guild {}: nodo {} recuperado", guild_id, node);
                PoolNotice::NodeRecovered {
                    node: node.to_string(),
                }
            } else {
                info!("➡️ Guild {}: {} → {}", guild_id, previous, node);
                assignment.node = node.to_string();
                PoolNotice::Migrated {
                    from: previous,
                    to: node.to_string(),
                }
            };

            if assignment.session.send(notice).is_err() {
                self.guilds.remove(&guild_id);
            }
        }
    }
}
