use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::events::StatusUpdate;

/// Consumes the status stream until every sender is gone.
///
/// Without a Discord client attached the updates are only logged; a
/// presentation layer would render them as messages instead.
pub fn spawn_status_logger(updates: flume::Receiver<StatusUpdate>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(update) = updates.recv_async().await {
            let guild_id = update.guild_id();
            match &update {
                StatusUpdate::TrackFailed { .. }
                | StatusUpdate::NodeFailure { .. }
                | StatusUpdate::PlaybackInterrupted { .. } => {
                    warn!("[guild {}] {}", guild_id, update)
                }
                StatusUpdate::NowPlaying { .. } | StatusUpdate::Left { .. } => {
                    info!("[guild {}] {}", guild_id, update)
                }
                _ => debug!("[guild {}] {}", guild_id, update),
            }
        }
        debug!("Canal de estados cerrado");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serenity::model::id::GuildId;

    #[tokio::test]
    async fn logger_stops_when_senders_are_gone() {
        let (tx, rx) = flume::unbounded();
        let task = spawn_status_logger(rx);

        tx.send(StatusUpdate::QueueEmpty {
            guild_id: GuildId::new(1),
        })
        .unwrap();
        drop(tx);

        task.await.unwrap();
    }
}
