use rand::seq::SliceRandom;
use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info};

use crate::{
    audio::track::Track,
    error::{MusicError, MusicResult},
};

/// Upcoming tracks of one guild, in play order.
///
/// The current track is not part of the queue; the session holds it.
#[derive(Debug)]
pub struct MusicQueue {
    items: VecDeque<Track>,
    max_size: usize,
}

impl MusicQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Agrega múltiples tracks (playlist), hasta llenar la cola
    pub fn add_tracks(&mut self, tracks: Vec<Track>) -> MusicResult<usize> {
        let available_space = self.max_size.saturating_sub(self.items.len());
        if available_space == 0 && !tracks.is_empty() {
            return Err(MusicError::QueueFull(self.max_size));
        }

        let to_add = tracks.len().min(available_space);
        self.items.extend(tracks.into_iter().take(to_add));

        info!("➕ Agregadas {} canciones a la cola", to_add);
        Ok(to_add)
    }

    /// Obtiene el siguiente track (FIFO)
    pub fn next_track(&mut self) -> Option<Track> {
        self.items.pop_front()
    }

    /// Elimina un track específico
    pub fn remove_track(&mut self, index: usize) -> MusicResult<Track> {
        let track = self
            .items
            .remove(index)
            .ok_or(MusicError::IndexOutOfRange(index))?;
        debug!("❌ Track eliminado en posición {}", index);
        Ok(track)
    }

    /// Mueve un track a una nueva posición
    pub fn move_track(&mut self, from: usize, to: usize) -> MusicResult<()> {
        if from >= self.items.len() {
            return Err(MusicError::IndexOutOfRange(from));
        }
        if to >= self.items.len() {
            return Err(MusicError::IndexOutOfRange(to));
        }

        if from != to {
            if let Some(track) = self.items.remove(from) {
                self.items.insert(to, track);
            }
            debug!("📍 Track movido de posición {} a {}", from, to);
        }

        Ok(())
    }

    /// Mezcla la cola
    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.items.make_contiguous().shuffle(&mut rng);
        info!("🔀 Cola mezclada");
    }

    /// Limpia la cola y devuelve cuántos tracks se quitaron
    pub fn clear(&mut self) -> usize {
        let cleared = self.items.len();
        self.items.clear();
        info!("🗑️ Cola limpiada: {} tracks removidos", cleared);
        cleared
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.items.iter().cloned().collect()
    }

    pub fn total_duration(&self) -> Duration {
        self.items.iter().map(|t| t.length).sum()
    }
}
