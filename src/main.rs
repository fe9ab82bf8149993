use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use helix_music::{
    audio::{
        autoqueue::{TrackRecommender, YouTubeMixRecommender},
        player::SessionContext,
        registry::SessionRegistry,
    },
    bot::{events::spawn_status_logger, Gateway},
    config::Config,
    lavalink::{transport::WebSocketConnector, NodePool},
    storage::JsonStorage,
};

const CACHE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("helix_music=debug".parse()?)
                .add_directive("tungstenite=info".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Helix Music v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    // Inicializar almacenamiento JSON
    let storage = Arc::new(JsonStorage::new(config.data_dir.clone(), config.max_history).await?);

    // Conectar nodos Lavalink
    info!("🎼 Conectando {} nodos Lavalink...", config.nodes.len());
    let pool = NodePool::start(&config, Arc::new(WebSocketConnector::new())).await?;
    if pool.select_node().is_err() {
        warn!("⚠️ Ningún nodo disponible todavía, se seguirá reintentando");
    }

    let (status_tx, status_rx) = flume::unbounded();
    let status_logger = spawn_status_logger(status_rx);

    let recommender: Arc<dyn TrackRecommender> = Arc::new(YouTubeMixRecommender::new(pool.clone()));
    let registry = SessionRegistry::new(SessionContext {
        pool: pool.clone(),
        store: storage.clone(),
        recommender: Some(recommender),
        status: status_tx,
        default_policy: config.default_policy,
        auto_leave_grace: config.auto_leave_grace(),
        max_queue_size: config.max_queue_size,
    });
    let gateway = Gateway::new(registry.clone());

    // Mantenimiento periódico del caché de búsquedas
    let maintenance_pool = pool.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_MAINTENANCE_INTERVAL);
        loop {
            interval.tick().await;
            maintenance_pool.search_cache().cleanup_old_entries();
        }
    });

    info!("🚀 Núcleo de reproducción listo ({} sesiones)", gateway.registry().len());

    // Manejar shutdown graceful
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Error al registrar Ctrl+C: {:?}", e);
    }
    info!("⚠️ Señal de shutdown recibida, cerrando...");

    registry.shutdown().await;
    drop(gateway);
    drop(registry);
    if tokio::time::timeout(Duration::from_secs(5), status_logger).await.is_err() {
        warn!("El registro de estados no terminó a tiempo");
    }

    match storage.stats().await {
        Ok(stats) => info!("{}", stats),
        Err(e) => warn!("No se pudieron leer las estadísticas: {:#}", e),
    }
    info!("👋 Helix Music detenido");
    Ok(())
}

/// Exits successfully when at least one node accepts a connection.
async fn health_check(config: &Config) -> Result<()> {
    let pool = NodePool::start(config, Arc::new(WebSocketConnector::new())).await?;
    let healthy = pool.wait_for_any_ready(config.connect_timeout()).await;
    pool.shutdown();

    if healthy {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Ningún nodo Lavalink responde");
    }
}
