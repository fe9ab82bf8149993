use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::{collections::HashMap, path::PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        policy::PlaybackPolicy,
        track::{ResumePoint, Track},
    },
    error::{MusicError, MusicResult},
};

/// Persistence used by playback sessions.
///
/// Every failure is non-fatal for the caller: sessions log it and carry
/// on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyStore: Send + Sync + 'static {
    /// `None` when the guild never saved a policy.
    async fn load_policy(&self, guild_id: GuildId) -> MusicResult<Option<PlaybackPolicy>>;

    async fn save_policy(&self, guild_id: GuildId, policy: PlaybackPolicy) -> MusicResult<()>;

    async fn append_history(&self, guild_id: GuildId, track: Track) -> MusicResult<()>;

    /// Stores where playback stood, or clears it with `None`.
    async fn save_resume_point(
        &self,
        guild_id: GuildId,
        point: Option<ResumePoint>,
    ) -> MusicResult<()>;
}

/// Datos persistidos de un servidor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuildRecord {
    pub guild_id: u64,
    #[serde(default)]
    pub policy: Option<PlaybackPolicy>,
    /// Más reciente al final
    #[serde(default)]
    pub history: Vec<Track>,
    #[serde(default)]
    pub resume_point: Option<ResumePoint>,
}

/// Manager de almacenamiento basado en archivos JSON
///
/// One `guild_<id>.json` file per guild under `<data_dir>/guilds`.
pub struct JsonStorage {
    data_dir: PathBuf,
    max_history: usize,
    cache: Mutex<HashMap<u64, GuildRecord>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf, max_history: usize) -> Result<Self> {
        let guilds_dir = data_dir.join("guilds");
        fs::create_dir_all(&guilds_dir)
            .await
            .with_context(|| format!("No se pudo crear {}", guilds_dir.display()))?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        Ok(Self {
            data_dir,
            max_history,
            cache: Mutex::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Obtiene el registro de un servidor (vacío si no existe)
    pub async fn record(&self, guild_id: GuildId) -> Result<GuildRecord> {
        let key = guild_id.get();
        if let Some(record) = self.cache.lock().get(&key) {
            return Ok(record.clone());
        }

        let path = self.guild_file_path(key);
        let record = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("JSON inválido en {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GuildRecord {
                guild_id: key,
                ..GuildRecord::default()
            },
            Err(e) => return Err(e).with_context(|| format!("Error leyendo {}", path.display())),
        };

        self.cache.lock().insert(key, record.clone());
        Ok(record)
    }

    pub async fn history(&self, guild_id: GuildId) -> Result<Vec<Track>> {
        Ok(self.record(guild_id).await?.history)
    }

    /// Obtiene estadísticas de almacenamiento
    pub async fn stats(&self) -> Result<StorageStats> {
        let mut files = fs::read_dir(self.data_dir.join("guilds")).await?;
        let mut file_count = 0;
        let mut total_size = 0;

        while let Some(entry) = files.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                file_count += 1;
                if let Ok(metadata) = entry.metadata().await {
                    total_size += metadata.len();
                }
            }
        }

        Ok(StorageStats {
            guild_files: file_count,
            cached_records: self.cache.lock().len(),
            total_size_bytes: total_size,
            data_dir: self.data_dir.clone(),
        })
    }

    /// Read-modify-write of one guild record. Writes are serialized so two
    /// updates never interleave on the same file.
    async fn update<F>(&self, guild_id: GuildId, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut GuildRecord),
    {
        let _guard = self.write_lock.lock().await;

        let mut record = self.record(guild_id).await?;
        mutate(&mut record);

        let path = self.guild_file_path(record.guild_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&record)?;
        fs::write(&tmp, content)
            .await
            .with_context(|| format!("Error escribiendo {}", tmp.display()))?;
        fs::rename(&tmp, &path).await?;

        self.cache.lock().insert(record.guild_id, record);
        Ok(())
    }

    fn guild_file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir
            .join("guilds")
            .join(format!("guild_{}.json", guild_id))
    }
}

fn persistence(e: anyhow::Error) -> MusicError {
    MusicError::Persistence(format!("{:#}", e))
}

#[async_trait]
impl PolicyStore for JsonStorage {
    async fn load_policy(&self, guild_id: GuildId) -> MusicResult<Option<PlaybackPolicy>> {
        Ok(self.record(guild_id).await.map_err(persistence)?.policy)
    }

    async fn save_policy(&self, guild_id: GuildId, policy: PlaybackPolicy) -> MusicResult<()> {
        self.update(guild_id, |record| record.policy = Some(policy))
            .await
            .map_err(persistence)?;
        info!("💾 Política actualizada para guild {}", guild_id);
        Ok(())
    }

    async fn append_history(&self, guild_id: GuildId, track: Track) -> MusicResult<()> {
        let max = self.max_history;
        self.update(guild_id, |record| {
            record.history.push(track);
            if record.history.len() > max {
                let excess = record.history.len() - max;
                record.history.drain(..excess);
            }
        })
        .await
        .map_err(persistence)?;
        debug!("📜 Historial actualizado para guild {}", guild_id);
        Ok(())
    }

    async fn save_resume_point(
        &self,
        guild_id: GuildId,
        point: Option<ResumePoint>,
    ) -> MusicResult<()> {
        if let Some(point) = &point {
            debug!(
                "📍 Guardando posición de guild {}: {} @ {:?}",
                guild_id, point.track.title, point.position
            );
        }
        self.update(guild_id, |record| record.resume_point = point)
            .await
            .map_err(|e| {
                warn!("Error guardando posición de guild {}: {:#}", guild_id, e);
                persistence(e)
            })
    }
}

/// Estadísticas de almacenamiento
#[derive(Debug)]
pub struct StorageStats {
    pub guild_files: usize,
    pub cached_records: usize,
    pub total_size_bytes: u64,
    pub data_dir: PathBuf,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "📊 Storage Stats:\n\
             📁 Data Directory: {}\n\
             📝 Guild files: {}\n\
             💾 Cached records: {} in memory\n\
             📦 Total Size: {} bytes ({:.2} KB)",
            self.data_dir.display(),
            self.guild_files,
            self.cached_records,
            self.total_size_bytes,
            self.total_size_bytes as f64 / 1024.0
        )
    }
}
