use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::FaultKind;

pub const DEFAULT_CEILING: u32 = 3;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Contador que expira `window` después de la primera ocurrencia
#[derive(Debug, Clone, Copy)]
struct FaultCounter {
    count: u32,
    first_at: Instant,
}

impl FaultCounter {
    fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.first_at) >= window
    }
}

/// Límite de errores de reproducción por servidor y tipo.
///
/// Cada ocurrencia suma 1 al contador de `(guild, kind)`. El contador se borra
/// `window` después de la primera ocurrencia; superar `ceiling` dentro de la
/// ventana es un error crítico.
#[derive(Debug)]
pub struct ErrorLimiter {
    counters: DashMap<(GuildId, FaultKind), FaultCounter>,
    ceiling: u32,
    window: Duration,
}

impl Default for ErrorLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CEILING, DEFAULT_WINDOW)
    }
}

impl ErrorLimiter {
    pub fn new(ceiling: u32, window: Duration) -> Self {
        Self {
            counters: DashMap::new(),
            ceiling,
            window,
        }
    }

    /// Registra una ocurrencia; devuelve `true` si se superó el límite
    pub fn record(&self, guild_id: GuildId, kind: FaultKind) -> bool {
        self.record_at(guild_id, kind, Instant::now())
    }

    pub fn record_at(&self, guild_id: GuildId, kind: FaultKind, now: Instant) -> bool {
        let mut counter = self
            .counters
            .entry((guild_id, kind))
            .or_insert(FaultCounter {
                count: 0,
                first_at: now,
            });

        if counter.is_expired(now, self.window) {
            *counter = FaultCounter {
                count: 0,
                first_at: now,
            };
        }

        counter.count += 1;
        let count = counter.count;
        drop(counter);

        debug!("⚠️ Error {} en guild {}: {}/{}", kind, guild_id, count, self.ceiling);

        if count > self.ceiling {
            warn!(
                "🚨 Guild {} superó el límite de errores {} ({} en {:?})",
                guild_id, kind, count, self.window
            );
            true
        } else {
            false
        }
    }

    pub fn count(&self, guild_id: GuildId, kind: FaultKind) -> u32 {
        self.counters
            .get(&(guild_id, kind))
            .filter(|counter| !counter.is_expired(Instant::now(), self.window))
            .map(|counter| counter.count)
            .unwrap_or(0)
    }

    /// Olvida todos los contadores de un servidor (al destruir su player)
    pub fn reset(&self, guild_id: GuildId) {
        self.counters.retain(|(guild, _), _| *guild != guild_id);
    }

    /// Limpia contadores vencidos y retorna cuántos se removieron
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters
            .retain(|_, counter| !counter.is_expired(now, self.window));
        before.saturating_sub(self.counters.len())
    }
}
