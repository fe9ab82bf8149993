use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::PathBuf, time::Duration};
use url::Url;

use crate::audio::policy::PlaybackPolicy;

/// Connection settings for one Lavalink node.
///
/// Nodes are listed in order of operator preference: when two Ready nodes
/// report the same load, the one listed first wins.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeDescriptor {
    pub identifier: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub secure: bool,
    /// Intentos de reconexión antes de cerrar el nodo definitivamente
    #[serde(default = "default_retry_amount")]
    pub retry_amount: u32,
    /// Intervalo base del backoff, en milisegundos
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_retry_amount() -> u32 {
    200
}

fn default_retry_delay_ms() -> u64 {
    40
}

impl NodeDescriptor {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// WebSocket endpoint of the node.
    pub fn ws_url(&self) -> Result<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        Url::parse(&format!("{}://{}:{}/", scheme, self.host, self.port))
            .with_context(|| format!("URL inválida para el nodo {}", self.identifier))
    }

    /// REST endpoint of the node for the given path.
    pub fn http_url(&self, path: &str) -> Result<Url> {
        let scheme = if self.secure { "https" } else { "http" };
        Url::parse(&format!("{}://{}:{}{}", scheme, self.host, self.port, path))
            .with_context(|| format!("URL inválida para el nodo {}", self.identifier))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Identidad del bot
    pub bot_name: String,
    pub client_id: u64,

    // Nodos
    pub nodes: Vec<NodeDescriptor>,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_missed_heartbeats: u32,
    pub max_backoff_ms: u64,

    // Reproducción
    pub default_policy: PlaybackPolicy,
    pub auto_leave_grace_secs: u64,
    pub max_queue_size: usize,
    pub max_history: usize,
    pub search_cache_ttl_secs: u64,

    // Paths
    pub data_dir: PathBuf,
}

impl Config {
    /// Loads configuration from defaults, an optional TOML file and
    /// `HELIX__*` environment variables, in that order of precedence.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = std::env::var("HELIX_CONFIG").unwrap_or_else(|_| "helix.toml".to_string());

        let config: Config = ::config::Config::builder()
            .add_source(
                ::config::Config::try_from(&Config::default())
                    .context("Error serializando configuración por defecto")?,
            )
            .add_source(::config::File::with_name(&path).required(false))
            .add_source(
                ::config::Environment::with_prefix("HELIX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Error al leer la configuración")?
            .try_deserialize()
            .context("Configuración con formato inválido")?;

        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - At least one node, with unique identifiers and a non-zero port
    /// - `client_id` must be set (Discord ids are never zero)
    /// - Heartbeat and timeout intervals must be positive
    /// - Queue limits must be greater than zero
    pub fn validate(&self) -> Result<()> {
        if self.client_id == 0 {
            anyhow::bail!("client_id es obligatorio");
        }

        if self.nodes.is_empty() {
            anyhow::bail!("Debe configurarse al menos un nodo Lavalink");
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.identifier.as_str()) {
                anyhow::bail!("Identificador de nodo duplicado: {}", node.identifier);
            }
            if node.port == 0 {
                anyhow::bail!("El nodo {} tiene puerto 0", node.identifier);
            }
            if node.retry_amount == 0 {
                anyhow::bail!("El nodo {} necesita retry_amount > 0", node.identifier);
            }
        }

        if self.connect_timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            anyhow::bail!("Los timeouts de conexión y heartbeat deben ser mayores que 0");
        }

        if self.max_missed_heartbeats == 0 {
            anyhow::bail!("max_missed_heartbeats debe ser mayor que 0");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn auto_leave_grace(&self) -> Duration {
        Duration::from_secs(self.auto_leave_grace_secs)
    }

    pub fn search_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.search_cache_ttl_secs)
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Node passwords are never included.
    pub fn summary(&self) -> String {
        let nodes = self
            .nodes
            .iter()
            .map(|n| format!("{}@{}:{}", n.identifier, n.host, n.port))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "Config Summary:\n  \
            Bot: {} (client {})\n  \
            Nodes: [{}]\n  \
            Heartbeat: {} (max {} perdidos), connect timeout {}\n  \
            Auto-leave: {}, queue {} max, history {} max\n  \
            Policy: {:?}",
            self.bot_name,
            self.client_id,
            nodes,
            humantime::format_duration(self.heartbeat_interval()),
            self.max_missed_heartbeats,
            humantime::format_duration(self.connect_timeout()),
            humantime::format_duration(self.auto_leave_grace()),
            self.max_queue_size,
            self.max_history,
            self.default_policy,
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_name: "Helix Music".to_string(),
            client_id: 0,

            nodes: vec![NodeDescriptor {
                identifier: "Local Node".to_string(),
                host: "localhost".to_string(),
                port: 2333,
                password: "youshallnotpass".to_string(),
                secure: false,
                retry_amount: default_retry_amount(),
                retry_delay_ms: default_retry_delay_ms(),
            }],
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            max_missed_heartbeats: 3,
            max_backoff_ms: 30_000,

            default_policy: PlaybackPolicy::default(),
            auto_leave_grace_secs: 300,
            max_queue_size: 1000,
            max_history: 50,
            search_cache_ttl_secs: 600,

            data_dir: "/app/data".into(),
        }
    }
}
