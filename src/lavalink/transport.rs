use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::HeaderValue,
    protocol::Message,
};
use tracing::{debug, warn};

use crate::{
    config::NodeDescriptor,
    error::{MusicError, MusicResult},
    lavalink::{
        protocol::{IncomingMessage, OutgoingMessage},
        ClientInfo,
    },
};

/// Frames the node actor pushes toward the node.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Message(OutgoingMessage),
    Ping,
}

/// Frames coming back from the node.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Message(IncomingMessage),
    /// Any frame that proves the node is alive but carries no op we use.
    Heartbeat,
    Closed { code: Option<u16>, reason: String },
}

/// An established, authenticated link to one node.
///
/// Dropping `outbound` closes the link.
pub struct NodeLink {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

/// Opens links to nodes. The WebSocket implementation is used in
/// production; tests plug in in-memory links.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, node: &NodeDescriptor, client: &ClientInfo) -> MusicResult<NodeLink>;
}

/// Lavalink v3 WebSocket connector.
#[derive(Debug, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

fn transport_err(node: &NodeDescriptor, e: impl std::fmt::Display) -> MusicError {
    MusicError::Transport {
        node: node.identifier.clone(),
        message: e.to_string(),
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, node: &NodeDescriptor, client: &ClientInfo) -> MusicResult<NodeLink> {
        let url = node.ws_url().map_err(|e| transport_err(node, e))?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| transport_err(node, e))?;

        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&node.password).map_err(|e| transport_err(node, e))?,
        );
        headers.insert(
            "User-Id",
            HeaderValue::from_str(&client.user_id.get().to_string())
                .map_err(|e| transport_err(node, e))?,
        );
        headers.insert(
            "Client-Name",
            HeaderValue::from_str(&client.client_name).map_err(|e| transport_err(node, e))?,
        );

        debug!("[{}] Conectando a {}", node.identifier, url);
        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| transport_err(node, e))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<InboundFrame>();

        let identifier = node.identifier.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let msg = match frame {
                    OutboundFrame::Message(msg) => match serde_json::to_string(&msg) {
                        Ok(json) => Message::Text(json.into()),
                        Err(e) => {
                            warn!("[{}] No se pudo serializar {:?}: {}", identifier, msg, e);
                            continue;
                        }
                    },
                    OutboundFrame::Ping => Message::Ping(Vec::<u8>::new().into()),
                };
                if let Err(e) = write.send(msg).await {
                    warn!("[{}] WS write error: {}", identifier, e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let identifier = node.identifier.clone();
        tokio::spawn(async move {
            loop {
                // A dropped link must not leave the socket waiting on a
                // silent node.
                let msg = tokio::select! {
                    _ = in_tx.closed() => {
                        debug!("[{}] Enlace descartado, cerrando lector", identifier);
                        return;
                    }
                    msg = read.next() => msg,
                };
                let Some(msg) = msg else {
                    break;
                };
                let frame = match msg {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<IncomingMessage>(text.as_str()) {
                            Ok(msg) => InboundFrame::Message(msg),
                            Err(e) => {
                                debug!("[{}] Op ignorado: {}", identifier, e);
                                InboundFrame::Heartbeat
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_string()))
                            .unwrap_or((None, String::new()));
                        let _ = in_tx.send(InboundFrame::Closed { code, reason });
                        return;
                    }
                    Ok(_) => InboundFrame::Heartbeat,
                    Err(e) => {
                        let _ = in_tx.send(InboundFrame::Closed {
                            code: None,
                            reason: e.to_string(),
                        });
                        return;
                    }
                };
                if in_tx.send(frame).is_err() {
                    return;
                }
            }
            let _ = in_tx.send(InboundFrame::Closed {
                code: None,
                reason: "stream terminado".to_string(),
            });
        });

        Ok(NodeLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
