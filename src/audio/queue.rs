use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{audio::track::Track, error::QueueError};

/// Puntuación mínima para que `find_by_query` acepte una coincidencia
const MATCH_THRESHOLD: f64 = 0.4;

const TITLE_WEIGHT: f64 = 1.0;
const ARTIST_WEIGHT: f64 = 0.7;
const URI_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    #[default]
    Disabled,
    Track,
    Queue,
}

/// Cola de reproducción con puntero a la canción actual.
///
/// Los tracks ya reproducidos se quedan en la lista; `current` sólo avanza.
/// Invariante: `0 <= current <= len`. `current == len` significa que la cola
/// terminó.
#[derive(Debug, Default)]
pub struct Queue {
    tracks: Vec<Track>,
    current: usize,
    loop_state: LoopState,
    recommendations: Vec<Track>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loop_state(loop_state: LoopState) -> Self {
        Self {
            loop_state,
            ..Self::default()
        }
    }

    /// Agrega uno o varios tracks; con `at` los inserta en esa posición
    pub fn add(&mut self, tracks: impl Into<Vec<Track>>, at: Option<usize>) -> Result<(), QueueError> {
        let tracks = tracks.into();

        match at {
            Some(index) if index <= self.current => {
                return Err(QueueError::BeforeCurrent {
                    index,
                    current: self.current,
                });
            }
            Some(index) if index > self.tracks.len() => {
                return Err(QueueError::OutOfBounds {
                    index,
                    len: self.tracks.len(),
                });
            }
            Some(index) => {
                let added = tracks.len();
                self.tracks.splice(index..index, tracks);
                info!("➕ Agregadas {} canciones en la posición {}", added, index);
            }
            None => {
                let added = tracks.len();
                self.tracks.extend(tracks);
                info!("➕ Agregadas {} canciones a la cola", added);
            }
        }

        Ok(())
    }

    /// Elimina el rango inclusivo `start..=end` (o sólo `start`)
    pub fn remove(&mut self, start: usize, end: Option<usize>) -> Result<Vec<Track>, QueueError> {
        let len = self.tracks.len();
        let last = end.unwrap_or(start);

        if start >= len {
            return Err(QueueError::OutOfBounds { index: start, len });
        }
        if last >= len {
            return Err(QueueError::OutOfBounds { index: last, len });
        }
        if let Some(end) = end {
            if start >= end {
                return Err(QueueError::InvalidRange { start, end });
            }
        }
        if (start..=last).contains(&self.current) {
            return Err(QueueError::IncludesCurrent {
                start,
                end: last,
                current: self.current,
            });
        }

        let removed: Vec<Track> = self.tracks.drain(start..=last).collect();
        if last < self.current {
            self.current -= removed.len();
        }

        debug!("❌ Eliminadas {} canciones ({}..={})", removed.len(), start, last);
        Ok(removed)
    }

    /// Avanza según el modo de loop. `force` ignora el loop (salto manual).
    pub fn next(&mut self, force: bool) -> Option<&Track> {
        let len = self.tracks.len();

        match self.loop_state {
            _ if force => self.current = (self.current + 1).min(len),
            LoopState::Disabled => self.current = (self.current + 1).min(len),
            LoopState::Queue => {
                self.current += 1;
                if self.current >= len {
                    self.current = 0;
                }
            }
            LoopState::Track => {}
        }

        self.current()
    }

    /// Salta `amount` canciones; llegar al final con loop de cola vuelve a 0
    pub fn advance(&mut self, amount: usize) -> Result<(), QueueError> {
        let len = self.tracks.len();
        let invalid = QueueError::InvalidSkip {
            amount,
            current: self.current,
            len,
        };

        let target = match self.current.checked_add(amount) {
            Some(target) if amount > 0 && target <= len => target,
            _ => return Err(invalid),
        };

        self.current = if target == len && self.loop_state == LoopState::Queue {
            0
        } else {
            target
        };
        Ok(())
    }

    /// Mezcla sólo las canciones que vienen después de la actual
    pub fn shuffle(&mut self) {
        let start = self.current + 1;
        if start >= self.tracks.len() {
            return;
        }

        let mut rng = rand::thread_rng();
        self.tracks[start..].shuffle(&mut rng);
        info!("🔀 Cola mezclada ({} canciones)", self.tracks.len() - start);
    }

    /// Busca la canción que mejor coincide con `text`
    pub fn find_by_query(&self, text: &str) -> Option<usize> {
        let query = text.trim().to_lowercase();
        if query.is_empty() {
            return None;
        }

        self.tracks
            .iter()
            .enumerate()
            .map(|(index, track)| {
                let score = [
                    similarity(&query, &track.title().to_lowercase()) * TITLE_WEIGHT,
                    similarity(&query, &track.artist().to_lowercase()) * ARTIST_WEIGHT,
                    similarity(&query, &track.uri().to_lowercase()) * URI_WEIGHT,
                ]
                .into_iter()
                .fold(0.0, f64::max);
                (index, score)
            })
            .filter(|(_, score)| *score >= MATCH_THRESHOLD)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(index, _)| index)
    }

    /// Mueve el puntero, limitado a `[0, len - 1]`
    pub fn set_current_index(&mut self, index: usize) {
        if self.tracks.is_empty() {
            return;
        }
        self.current = index.min(self.tracks.len() - 1);
    }

    /// Quita la canción actual (falló al cargar); el puntero queda sobre la siguiente
    pub(crate) fn take_current(&mut self) -> Option<Track> {
        if self.current >= self.tracks.len() {
            return None;
        }
        let track = self.tracks.remove(self.current);
        if self.loop_state == LoopState::Queue && self.current >= self.tracks.len() {
            self.current = 0;
        }
        Some(track)
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.recommendations.clear();
        self.current = 0;
        info!("🗑️ Cola limpiada");
    }

    pub fn current(&self) -> Option<&Track> {
        self.tracks.get(self.current)
    }

    pub fn current_mut(&mut self) -> Option<&mut Track> {
        self.tracks.get_mut(self.current)
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Canciones pendientes después de la actual
    pub fn upcoming(&self) -> &[Track] {
        let start = (self.current + 1).min(self.tracks.len());
        &self.tracks[start..]
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn loop_state(&self) -> LoopState {
        self.loop_state
    }

    pub fn set_loop_state(&mut self, loop_state: LoopState) {
        self.loop_state = loop_state;
        match loop_state {
            LoopState::Disabled => info!("➡️ Repetición desactivada"),
            LoopState::Track => info!("🔂 Repetir canción activado"),
            LoopState::Queue => info!("🔁 Repetir cola activado"),
        }
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.tracks.iter().map(Track::duration_ms).sum()
    }

    pub fn set_recommendations(&mut self, tracks: Vec<Track>) {
        self.recommendations = tracks;
    }

    pub fn pop_recommendation(&mut self) -> Option<Track> {
        if self.recommendations.is_empty() {
            None
        } else {
            Some(self.recommendations.remove(0))
        }
    }

    pub fn recommendations(&self) -> &[Track] {
        &self.recommendations
    }
}

/// Similitud entre 0 y 1 (coeficiente de Dice sobre bigramas)
fn similarity(query: &str, field: &str) -> f64 {
    if field.is_empty() {
        return 0.0;
    }
    if field == query {
        return 1.0;
    }
    if field.contains(query) {
        return 0.9;
    }

    let a = bigrams(query);
    let b = bigrams(field);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut remaining = b.clone();
    let mut shared = 0usize;
    for pair in &a {
        if let Some(pos) = remaining.iter().position(|other| other == pair) {
            remaining.swap_remove(pos);
            shared += 1;
        }
    }

    (2 * shared) as f64 / (a.len() + b.len()) as f64
}

fn bigrams(text: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}
