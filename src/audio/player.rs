use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        filters::{validate_bands, EqBand, Filters},
        limiter::ErrorLimiter,
        queue::{LoopState, Queue},
        track::Track,
        voice::{ChannelTransition, VoiceUpdate},
    },
    error::{FaultKind, PlayerError},
    node::{
        protocol::{OutgoingOp, TrackEndReason},
        Node,
    },
    sources::SearchProvider,
    storage::GuildSettings,
};

pub type SharedPlayer = Arc<Mutex<Player>>;
pub type PlayerRegistry = Arc<DashMap<GuildId, SharedPlayer>>;

/// Volumen máximo aceptado (1000 = 5x)
pub const MAX_VOLUME: u16 = 1000;

/// Polls inactivos consecutivos antes de avisar inactividad
const IDLE_POLLS_BEFORE_SIGNAL: u8 = 2;

/// Destino de los comandos del player (un nodo de audio)
#[async_trait]
pub trait PlayerTransport: Send + Sync {
    fn node_name(&self) -> &str;
    fn is_connected(&self) -> bool;
    /// `false` si el comando no pudo enviarse
    async fn send(&self, op: &OutgoingOp) -> bool;
}

#[async_trait]
impl PlayerTransport for Node {
    fn node_name(&self) -> &str {
        self.name()
    }

    fn is_connected(&self) -> bool {
        Node::is_connected(self)
    }

    async fn send(&self, op: &OutgoingOp) -> bool {
        Node::send(self, op)
    }
}

/// Presencia de voz del bot en Discord
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> anyhow::Result<()>;
    async fn leave(&self, guild_id: GuildId) -> anyhow::Result<()>;
    /// Usuarios (no bots) en el canal; `None` si el canal no está en caché
    fn listeners(&self, guild_id: GuildId, channel_id: ChannelId) -> Option<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Destroying,
}

/// Notificaciones hacia la capa de presentación
#[derive(Debug, Clone)]
pub enum PlayerSignal {
    TrackStarted { guild_id: GuildId, track: Box<Track> },
    QueueEnded { guild_id: GuildId },
    TrackErrored { guild_id: GuildId, kind: FaultKind, message: String },
    Inactivity { guild_id: GuildId },
    CriticalError { guild_id: GuildId, kind: FaultKind },
    Disconnected { guild_id: GuildId },
    Moved { guild_id: GuildId, from: ChannelId, to: ChannelId },
    NodeReconnecting { node: String, attempt: u32 },
    NodeLost { guild_id: GuildId, node: String },
}

/// Filtro de duración para las recomendaciones de autoplay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationFilter {
    /// `length < 300000 && length < 60000` (sólo pistas de menos de un minuto)
    #[default]
    Literal,
    /// Entre uno y cinco minutos
    Between,
}

impl RecommendationFilter {
    pub fn accepts(&self, length_ms: u64) -> bool {
        match self {
            Self::Literal => length_ms < 300_000 && length_ms < 60_000,
            Self::Between => (60_000..300_000).contains(&length_ms),
        }
    }
}

impl FromStr for RecommendationFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "literal" => Ok(Self::Literal),
            "between" => Ok(Self::Between),
            other => anyhow::bail!("Filtro de recomendaciones desconocido: '{}'", other),
        }
    }
}

/// Colaboradores compartidos por todos los players
#[derive(Clone)]
pub struct PlayerContext {
    pub gateway: Arc<dyn VoiceGateway>,
    pub search: Arc<dyn SearchProvider>,
    pub limiter: Arc<ErrorLimiter>,
    pub signals: mpsc::UnboundedSender<PlayerSignal>,
    pub registry: PlayerRegistry,
    pub recommendation_filter: RecommendationFilter,
}

/// Player de un servidor.
///
/// Mantiene la cola, el estado de reproducción y la conexión de voz, y traduce
/// las operaciones a comandos para el nodo al que está asignado.
pub struct Player {
    guild_id: GuildId,
    voice_channel_id: Option<ChannelId>,
    state: ConnectionState,
    node: Arc<dyn PlayerTransport>,
    queue: Queue,
    playing: bool,
    paused: bool,
    halted: bool,
    position: u64,
    volume_fraction: f32,
    filters: Filters,
    autoplay: bool,
    voice: Option<VoiceUpdate>,
    idle_polls: u8,
    monitor: CancellationToken,
    ctx: PlayerContext,
}

impl Player {
    pub fn new(
        guild_id: GuildId,
        node: Arc<dyn PlayerTransport>,
        settings: GuildSettings,
        ctx: PlayerContext,
    ) -> Self {
        Self {
            guild_id,
            voice_channel_id: None,
            state: ConnectionState::Disconnected,
            node,
            queue: Queue::with_loop_state(settings.loop_state),
            playing: false,
            paused: false,
            halted: false,
            position: 0,
            volume_fraction: settings.volume_fraction.clamp(0.0, 5.0),
            filters: settings.filters,
            autoplay: settings.autoplay,
            voice: None,
            idle_polls: 0,
            monitor: CancellationToken::new(),
            ctx,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn voice_channel_id(&self) -> Option<ChannelId> {
        self.voice_channel_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn node_name(&self) -> &str {
        self.node.node_name()
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut Queue {
        &mut self.queue
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.queue.current()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn volume_fraction(&self) -> f32 {
        self.volume_fraction
    }

    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    pub fn autoplay(&self) -> bool {
        self.autoplay
    }

    pub(crate) fn monitor_token(&self) -> CancellationToken {
        self.monitor.clone()
    }

    // ---- voz ----

    /// Pide al gateway entrar a `channel_id`
    pub async fn connect(&mut self, channel_id: ChannelId) -> Result<(), PlayerError> {
        self.ensure_alive()?;

        let same_channel = self.voice_channel_id == Some(channel_id);
        if same_channel
            && matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            return Ok(());
        }

        let previous = (self.state, self.voice_channel_id);
        self.state = ConnectionState::Connecting;
        self.voice_channel_id = Some(channel_id);

        if let Err(e) = self.ctx.gateway.join(self.guild_id, channel_id).await {
            (self.state, self.voice_channel_id) = previous;
            return Err(PlayerError::Gateway(e));
        }

        info!("🔊 Conectando a canal {} en guild {}", channel_id, self.guild_id);
        Ok(())
    }

    /// Pide al gateway salir del canal; el estado final llega con el evento de voz
    pub async fn disconnect(&mut self) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        if self.voice_channel_id.is_none() {
            return Err(PlayerError::NoVoiceChannel);
        }

        self.state = ConnectionState::Disconnecting;
        self.ctx
            .gateway
            .leave(self.guild_id)
            .await
            .map_err(PlayerError::Gateway)?;

        info!("👋 Saliendo del canal de voz en guild {}", self.guild_id);
        Ok(())
    }

    /// Entrega una actualización de voz completa al nodo
    pub async fn on_voice_update(&mut self, update: VoiceUpdate) -> bool {
        if self.state == ConnectionState::Destroying {
            return false;
        }

        self.voice = Some(update.clone());
        let op = OutgoingOp::voice_update(self.guild_id, update.session_id, update.event);
        if !self.node.send(&op).await {
            warn!(
                "⚠️ voiceUpdate de guild {} pendiente: nodo '{}' no disponible",
                self.guild_id,
                self.node.node_name()
            );
            return false;
        }

        if self.state != ConnectionState::Connected {
            self.state = ConnectionState::Connected;
            debug!("✅ Guild {} conectado al nodo '{}'", self.guild_id, self.node.node_name());
            self.push_settings().await;
        }
        true
    }

    /// Aplica un cambio de canal observado en el gateway
    pub fn on_channel_transition(&mut self, transition: ChannelTransition) {
        match transition {
            ChannelTransition::Connect(channel_id) => {
                self.voice_channel_id = Some(channel_id);
                if self.state == ConnectionState::Disconnected {
                    self.state = ConnectionState::Connecting;
                }
            }
            ChannelTransition::Move { from, to } => {
                self.voice_channel_id = Some(to);
                info!("🔀 Guild {}: movido de {} a {}", self.guild_id, from, to);
                self.signal(PlayerSignal::Moved {
                    guild_id: self.guild_id,
                    from,
                    to,
                });
            }
            ChannelTransition::Disconnect(_) => {
                self.voice_channel_id = None;
                self.voice = None;
                let previous = self.state;
                if previous == ConnectionState::Destroying {
                    return;
                }
                self.state = ConnectionState::Disconnected;
                self.playing = false;
                self.paused = false;

                // salida pedida con disconnect(): la cola se conserva
                if previous == ConnectionState::Disconnecting {
                    info!("👋 Guild {} fuera del canal de voz, cola conservada", self.guild_id);
                    return;
                }
                info!("🔇 Guild {} desconectado del canal de voz", self.guild_id);
                self.signal(PlayerSignal::Disconnected {
                    guild_id: self.guild_id,
                });
            }
        }
    }

    /// Estado de voz del bot observado en el gateway.
    ///
    /// Además de los cambios de canal, confirma un `connect()` a otro canal
    /// cuando Discord no manda un `VOICE_SERVER_UPDATE` nuevo.
    pub fn on_voice_state(&mut self, channel_id: Option<ChannelId>) {
        if let Some(transition) = ChannelTransition::detect(self.voice_channel_id, channel_id) {
            self.on_channel_transition(transition);
            return;
        }

        let confirmed = channel_id.is_some() && channel_id == self.voice_channel_id;
        if confirmed && self.state == ConnectionState::Connecting && self.voice.is_some() {
            self.state = ConnectionState::Connected;
            debug!("✅ Guild {} confirmado en canal {:?}", self.guild_id, channel_id);
        }
    }

    // ---- reproducción ----

    /// Reproduce la canción actual de la cola
    pub async fn play(&mut self) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        if self.queue.current().is_none() {
            return Err(PlayerError::NothingToPlay);
        }
        self.halted = false;
        self.play_current(0).await
    }

    pub async fn pause(&mut self, pause: bool) -> Result<bool, PlayerError> {
        self.ensure_alive()?;
        if self.paused == pause {
            return Ok(false);
        }

        self.send_or_fail(OutgoingOp::pause(self.guild_id, pause)).await?;
        self.paused = pause;
        info!(
            "{} Guild {}",
            if pause { "⏸️ Pausado" } else { "▶️ Reanudado" },
            self.guild_id
        );
        Ok(true)
    }

    /// `volume` en 0..=1000, donde 200 es el volumen original
    pub async fn set_volume(&mut self, volume: u16) -> Result<bool, PlayerError> {
        self.ensure_alive()?;
        if volume > MAX_VOLUME {
            return Err(PlayerError::InvalidVolume(volume));
        }

        let fraction = volume as f32 / 200.0;
        let level = node_volume(fraction);
        if level == node_volume(self.volume_fraction) {
            return Ok(false);
        }

        self.send_or_fail(OutgoingOp::volume(self.guild_id, level)).await?;
        self.volume_fraction = fraction;
        info!("🔊 Volumen de guild {} ajustado a {}%", self.guild_id, level);
        Ok(true)
    }

    pub async fn seek(&mut self, position_ms: u64) -> Result<bool, PlayerError> {
        self.ensure_alive()?;
        let track = self.queue.current().ok_or(PlayerError::NothingToPlay)?;
        if !track.is_seekable() {
            return Err(PlayerError::NotSeekable);
        }

        let position = position_ms.min(track.duration_ms());
        if position == self.position {
            return Ok(false);
        }

        self.send_or_fail(OutgoingOp::seek(self.guild_id, position)).await?;
        self.position = position;
        debug!("⏩ Guild {} posición {}ms", self.guild_id, position);
        Ok(true)
    }

    pub async fn set_filters(&mut self, filters: Filters) -> Result<bool, PlayerError> {
        self.ensure_alive()?;
        filters.validate()?;
        if filters == self.filters {
            return Ok(false);
        }

        self.send_or_fail(OutgoingOp::filters(self.guild_id, filters.clone()))
            .await?;
        self.filters = filters;
        info!("🎛️ Filtros actualizados en guild {}", self.guild_id);
        Ok(true)
    }

    pub async fn set_equalizer(&mut self, bands: Vec<EqBand>) -> Result<bool, PlayerError> {
        validate_bands(&bands)?;
        let filters = self.filters.clone().with_equalizer(bands);
        self.set_filters(filters).await
    }

    /// No envía nada al nodo; devuelve si el modo cambió
    pub fn set_loop_state(&mut self, loop_state: LoopState) -> bool {
        if self.queue.loop_state() == loop_state {
            return false;
        }
        self.queue.set_loop_state(loop_state);
        true
    }

    pub fn set_autoplay(&mut self, autoplay: bool) -> bool {
        let changed = self.autoplay != autoplay;
        self.autoplay = autoplay;
        changed
    }

    /// Salta `amount` canciones
    pub async fn skip(&mut self, amount: usize) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        self.queue.advance(amount)?;
        info!("⏭️ Guild {}: saltando {} canción(es)", self.guild_id, amount);

        if self.playing && self.node.send(&OutgoingOp::stop(self.guild_id)).await {
            // el nodo responde con STOPPED y on_track_end continúa
            return Ok(());
        }
        self.play_current(0).await
    }

    // ---- eventos del nodo ----

    pub fn on_player_update(&mut self, position: u64) {
        self.position = position;
    }

    pub fn on_track_start(&mut self) {
        self.playing = true;
        self.paused = false;
        if let Some(track) = self.queue.current() {
            info!("🎵 Guild {} reproduciendo: {}", self.guild_id, track.title());
            self.signal(PlayerSignal::TrackStarted {
                guild_id: self.guild_id,
                track: Box::new(track.clone()),
            });
        }
    }

    pub async fn on_track_end(&mut self, reason: TrackEndReason) -> Result<(), PlayerError> {
        if self.halted || self.state == ConnectionState::Destroying {
            return Ok(());
        }
        debug!("🏁 Guild {}: fin de track ({:?})", self.guild_id, reason);

        match reason {
            TrackEndReason::Finished => {
                self.queue.next(false);
                self.play_current(0).await
            }
            TrackEndReason::Stopped => self.play_current(0).await,
            TrackEndReason::Replaced => Ok(()),
            TrackEndReason::LoadFailed | TrackEndReason::Cleanup => {
                let kind = if reason == TrackEndReason::LoadFailed {
                    FaultKind::LoadFailed
                } else {
                    FaultKind::Cleanup
                };
                if let Some(failed) = self.queue.take_current() {
                    warn!("⚠️ Guild {}: '{}' descartado ({})", self.guild_id, failed.title(), kind);
                    self.signal(PlayerSignal::TrackErrored {
                        guild_id: self.guild_id,
                        kind,
                        message: format!("'{}' descartado", failed.title()),
                    });
                }
                self.play_current(0).await
            }
        }
    }

    pub async fn on_track_exception(&mut self, message: String) {
        if self.ctx.limiter.record(self.guild_id, FaultKind::Exception) {
            self.halt(FaultKind::Exception).await;
            return;
        }

        warn!("⚠️ Excepción en guild {}: {}", self.guild_id, message);
        self.signal(PlayerSignal::TrackErrored {
            guild_id: self.guild_id,
            kind: FaultKind::Exception,
            message,
        });
    }

    pub async fn on_track_stuck(&mut self, threshold_ms: u64) -> Result<(), PlayerError> {
        if self.ctx.limiter.record(self.guild_id, FaultKind::Stuck) {
            self.halt(FaultKind::Stuck).await;
            return Ok(());
        }

        warn!(
            "⚠️ Track atascado en guild {} ({}ms), saltando",
            self.guild_id, threshold_ms
        );
        self.signal(PlayerSignal::TrackErrored {
            guild_id: self.guild_id,
            kind: FaultKind::Stuck,
            message: format!("sin audio durante {}ms", threshold_ms),
        });

        self.queue.next(true);
        if self.node.send(&OutgoingOp::stop(self.guild_id)).await {
            return Ok(());
        }
        self.play_current(0).await
    }

    pub fn on_socket_closed(&mut self, code: u16, reason: &str, by_remote: bool) {
        warn!(
            "🔌 Voz de guild {} cerrada en el nodo: {} '{}' (remoto: {})",
            self.guild_id, code, reason, by_remote
        );
    }

    // ---- nodos ----

    /// Reenvía al nodo todo el estado: voz, volumen, filtros y la canción actual
    pub async fn resync(&mut self) -> bool {
        if self.state == ConnectionState::Destroying {
            return false;
        }

        if let Some(voice) = self.voice.clone() {
            let op = OutgoingOp::voice_update(self.guild_id, voice.session_id, voice.event);
            if !self.node.send(&op).await {
                return false;
            }
        }
        self.push_settings().await;

        if self.playing && !self.halted {
            let position = self.position;
            if let Err(e) = self.play_current(position).await {
                warn!("⚠️ No se pudo reanudar guild {}: {}", self.guild_id, e);
                return false;
            }
        }

        info!("🔄 Guild {} resincronizado con nodo '{}'", self.guild_id, self.node.node_name());
        true
    }

    /// Cambia de nodo y resincroniza
    pub async fn rebind(&mut self, node: Arc<dyn PlayerTransport>) -> bool {
        info!(
            "➡️ Guild {}: nodo '{}' -> '{}'",
            self.guild_id,
            self.node.node_name(),
            node.node_name()
        );
        self.node = node;
        self.resync().await
    }

    // ---- inactividad ----

    /// Un tick del monitor. Devuelve `true` cuando se emitió la señal.
    pub fn poll_inactivity(&mut self) -> bool {
        if self.state == ConnectionState::Destroying {
            return false;
        }

        let listeners = self
            .voice_channel_id
            .and_then(|channel| self.ctx.gateway.listeners(self.guild_id, channel))
            .unwrap_or(0);
        let idle = !self.playing || self.paused || listeners < 1;

        if !idle {
            self.idle_polls = 0;
            return false;
        }

        self.idle_polls += 1;
        debug!("💤 Guild {} inactivo ({}/{})", self.guild_id, self.idle_polls, IDLE_POLLS_BEFORE_SIGNAL);
        if self.idle_polls < IDLE_POLLS_BEFORE_SIGNAL {
            return false;
        }

        self.idle_polls = 0;
        info!("💤 Guild {} inactivo", self.guild_id);
        self.signal(PlayerSignal::Inactivity {
            guild_id: self.guild_id,
        });
        true
    }

    // ---- fin ----

    /// Libera todo. Llamarlo más de una vez no tiene efecto.
    pub async fn destroy(&mut self) {
        if self.state == ConnectionState::Destroying {
            return;
        }
        self.state = ConnectionState::Destroying;
        self.monitor.cancel();

        if self.node.is_connected() {
            self.node.send(&OutgoingOp::destroy(self.guild_id)).await;
        }
        if self.voice_channel_id.is_some() {
            if let Err(e) = self.ctx.gateway.leave(self.guild_id).await {
                warn!("⚠️ Error saliendo del canal en guild {}: {}", self.guild_id, e);
            }
        }

        self.queue.clear();
        self.playing = false;
        self.paused = false;
        self.voice = None;
        self.voice_channel_id = None;
        self.ctx.limiter.reset(self.guild_id);
        self.ctx.registry.remove(&self.guild_id);

        info!("🗑️ Player de guild {} destruido", self.guild_id);
    }

    // ---- internos ----

    fn ensure_alive(&self) -> Result<(), PlayerError> {
        if self.state == ConnectionState::Destroying {
            Err(PlayerError::Destroyed)
        } else {
            Ok(())
        }
    }

    async fn send_or_fail(&self, op: OutgoingOp) -> Result<(), PlayerError> {
        if self.node.send(&op).await {
            Ok(())
        } else {
            Err(PlayerError::NodeUnavailable {
                node: self.node.node_name().to_string(),
            })
        }
    }

    /// Reproduce lo que sea actual, descartando tracks que no resuelven.
    /// Sin nada más en la cola intenta autoplay y si no, termina la cola.
    async fn play_current(&mut self, start_ms: u64) -> Result<(), PlayerError> {
        let search = Arc::clone(&self.ctx.search);
        let mut autoplay_tried = false;

        loop {
            if self.queue.current().is_none() {
                if autoplay_tried || !self.enqueue_recommendation().await {
                    self.end_queue();
                    return Ok(());
                }
                autoplay_tried = true;
            }

            let Some(track) = self.queue.current_mut() else {
                continue;
            };

            let resolved = track.resolve(search.as_ref()).await.map(|_| ());
            match resolved {
                Ok(()) => break,
                Err(e) => {
                    let message = e.to_string();
                    if let Some(failed) = self.queue.take_current() {
                        warn!("⚠️ No se pudo resolver '{}': {}", failed.title(), message);
                    }
                    self.signal(PlayerSignal::TrackErrored {
                        guild_id: self.guild_id,
                        kind: FaultKind::Resolution,
                        message,
                    });
                }
            }
        }

        let encoded = match self.queue.current().and_then(Track::playable) {
            Some(playable) => playable.encoded.clone(),
            None => return Err(PlayerError::NothingToPlay),
        };

        self.send_or_fail(OutgoingOp::play(self.guild_id, encoded, Some(start_ms)))
            .await?;
        self.playing = true;
        self.paused = false;
        self.position = start_ms;
        Ok(())
    }

    async fn enqueue_recommendation(&mut self) -> bool {
        if !self.autoplay {
            return false;
        }

        if self.queue.recommendations().is_empty() {
            let Some(seed) = self.queue.tracks().last().cloned() else {
                return false;
            };

            let filter = self.ctx.recommendation_filter;
            match self.ctx.search.recommendations(&seed).await {
                Ok(results) => {
                    let picks: Vec<Track> = results
                        .into_iter()
                        .filter(|result| !result.is_stream && filter.accepts(result.duration_ms))
                        .map(Track::from)
                        .collect();
                    debug!("🎲 Guild {}: {} recomendaciones aceptadas", self.guild_id, picks.len());
                    self.queue.set_recommendations(picks);
                }
                Err(e) => {
                    warn!("⚠️ Autoplay falló en guild {}: {}", self.guild_id, e);
                    return false;
                }
            }
        }

        let Some(next) = self.queue.pop_recommendation() else {
            return false;
        };
        info!("🎲 Autoplay en guild {}: {}", self.guild_id, next.title());
        self.queue.add(vec![next], None).is_ok() && self.queue.current().is_some()
    }

    fn end_queue(&mut self) {
        self.playing = false;
        self.paused = false;
        self.position = 0;
        info!("📭 Cola terminada en guild {}", self.guild_id);
        self.signal(PlayerSignal::QueueEnded {
            guild_id: self.guild_id,
        });
    }

    async fn halt(&mut self, kind: FaultKind) {
        error!("🚨 Guild {}: demasiados errores ({}), deteniendo", self.guild_id, kind);
        self.halted = true;
        self.playing = false;
        self.node.send(&OutgoingOp::stop(self.guild_id)).await;
        self.signal(PlayerSignal::CriticalError {
            guild_id: self.guild_id,
            kind,
        });
    }

    async fn push_settings(&self) {
        if node_volume(self.volume_fraction) != 100 {
            self.node
                .send(&OutgoingOp::volume(self.guild_id, node_volume(self.volume_fraction)))
                .await;
        }
        if !self.filters.is_empty() {
            self.node
                .send(&OutgoingOp::filters(self.guild_id, self.filters.clone()))
                .await;
        }
    }

    fn signal(&self, signal: PlayerSignal) {
        if self.ctx.signals.send(signal).is_err() {
            debug!("Sin receptor de señales para guild {}", self.guild_id);
        }
    }
}

/// Volumen entero del nodo (100 = original) para una fracción 0.0-5.0
fn node_volume(fraction: f32) -> u16 {
    (fraction * 100.0).round() as u16
}

/// Lanza el monitor de inactividad. Sólo guarda un `Weak`, así que termina
/// solo cuando el player desaparece.
pub fn spawn_inactivity_monitor(player: &SharedPlayer, every: Duration, token: CancellationToken) -> JoinHandle<()> {
    let weak = Arc::downgrade(player);

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(player) = weak.upgrade() else { break };
                    player.lock().await.poll_inactivity();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::voice::VoiceServerEvent,
        sources::{MockSearchProvider, SearchResult},
    };
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};

    const GUILD: GuildId = GuildId::new(77);

    struct RecordingNode {
        connected: AtomicBool,
        sent: parking_lot::Mutex<Vec<OutgoingOp>>,
    }

    impl RecordingNode {
        fn new(connected: bool) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(connected),
                sent: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn ops(&self) -> Vec<&'static str> {
            self.sent.lock().iter().map(OutgoingOp::name).collect()
        }

        fn last(&self) -> Option<OutgoingOp> {
            self.sent.lock().last().cloned()
        }
    }

    #[async_trait]
    impl PlayerTransport for RecordingNode {
        fn node_name(&self) -> &str {
            "test"
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }

        async fn send(&self, op: &OutgoingOp) -> bool {
            if !self.is_connected() {
                return false;
            }
            self.sent.lock().push(op.clone());
            true
        }
    }

    struct Harness {
        player: Player,
        node: Arc<RecordingNode>,
        signals: mpsc::UnboundedReceiver<PlayerSignal>,
        registry: PlayerRegistry,
    }

    impl Harness {
        fn drain(&mut self) -> Vec<PlayerSignal> {
            std::iter::from_fn(|| self.signals.try_recv().ok()).collect()
        }
    }

    fn harness(gateway: MockVoiceGateway, search: MockSearchProvider) -> Harness {
        harness_with(gateway, search, GuildSettings::default())
    }

    fn harness_with(gateway: MockVoiceGateway, search: MockSearchProvider, settings: GuildSettings) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry: PlayerRegistry = Arc::new(DashMap::new());
        let node = RecordingNode::new(true);
        let ctx = PlayerContext {
            gateway: Arc::new(gateway),
            search: Arc::new(search),
            limiter: Arc::new(ErrorLimiter::default()),
            signals: tx,
            registry: registry.clone(),
            recommendation_filter: RecommendationFilter::Between,
        };
        let player = Player::new(GUILD, node.clone(), settings, ctx);
        Harness {
            player,
            node,
            signals: rx,
            registry,
        }
    }

    fn result(id: &str, duration_ms: u64) -> SearchResult {
        SearchResult {
            title: format!("Track {}", id),
            author: Some("Artist".to_string()),
            duration_ms,
            is_seekable: true,
            is_stream: false,
            encoded: format!("enc-{}", id),
            uri: Some(format!("https://youtu.be/{}", id)),
            identifier: id.to_string(),
            source_name: "youtube".to_string(),
        }
    }

    fn resolved(id: &str) -> Track {
        Track::from(result(id, 200_000))
    }

    fn played(node: &RecordingNode) -> Option<String> {
        node.sent.lock().iter().rev().find_map(|op| match op {
            OutgoingOp::Play { track, .. } => Some(track.clone()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn unresolvable_track_is_dropped_and_next_plays() {
        let mut search = MockSearchProvider::new();
        search.expect_search().returning(|_| Ok(Vec::new()));
        let mut h = harness(MockVoiceGateway::new(), search);
        h.player
            .queue_mut()
            .add(vec![Track::unresolved("Perdida", "Nadie", 1000, ""), resolved("b")], None)
            .unwrap();

        h.player.play().await.unwrap();

        assert_eq!(played(&h.node).as_deref(), Some("enc-b"));
        assert_eq!(h.player.queue().len(), 1);
        assert!(h.player.is_playing());
        assert!(matches!(
            h.drain().as_slice(),
            [PlayerSignal::TrackErrored { kind: FaultKind::Resolution, .. }]
        ));
    }

    #[tokio::test]
    async fn fourth_exception_in_window_is_critical() {
        let mut h = harness(MockVoiceGateway::new(), MockSearchProvider::new());

        for _ in 0..4 {
            h.player.on_track_exception("boom".to_string()).await;
        }

        let signals = h.drain();
        assert_eq!(signals.len(), 4);
        assert!(signals[..3]
            .iter()
            .all(|s| matches!(s, PlayerSignal::TrackErrored { kind: FaultKind::Exception, .. })));
        assert!(matches!(
            signals[3],
            PlayerSignal::CriticalError { kind: FaultKind::Exception, .. }
        ));
        assert_eq!(h.node.last(), Some(OutgoingOp::stop(GUILD)));

        // detenido: el STOPPED que responde el nodo no reanuda nada
        h.player.queue_mut().add(vec![resolved("x")], None).unwrap();
        h.player.on_track_end(TrackEndReason::Stopped).await.unwrap();
        assert_eq!(played(&h.node), None);
    }

    #[tokio::test]
    async fn track_end_reasons_drive_the_queue() {
        let mut h = harness(MockVoiceGateway::new(), MockSearchProvider::new());
        h.player
            .queue_mut()
            .add(vec![resolved("a"), resolved("b"), resolved("c")], None)
            .unwrap();
        h.player.play().await.unwrap();

        h.player.on_track_end(TrackEndReason::Finished).await.unwrap();
        assert_eq!(played(&h.node).as_deref(), Some("enc-b"));

        let sent_before = h.node.ops().len();
        h.player.on_track_end(TrackEndReason::Replaced).await.unwrap();
        assert_eq!(h.node.ops().len(), sent_before);

        h.player.on_track_end(TrackEndReason::LoadFailed).await.unwrap();
        assert_eq!(played(&h.node).as_deref(), Some("enc-c"));
        assert_eq!(h.player.queue().len(), 2);
        assert!(matches!(
            h.drain().as_slice(),
            [PlayerSignal::TrackErrored { kind: FaultKind::LoadFailed, .. }]
        ));

        h.player.on_track_end(TrackEndReason::Finished).await.unwrap();
        assert!(!h.player.is_playing());
        assert!(matches!(h.drain().last(), Some(PlayerSignal::QueueEnded { .. })));
    }

    #[tokio::test]
    async fn cleanup_end_reports_the_dropped_track() {
        let mut h = harness(MockVoiceGateway::new(), MockSearchProvider::new());
        h.player
            .queue_mut()
            .add(vec![resolved("a"), resolved("b")], None)
            .unwrap();
        h.player.play().await.unwrap();

        h.player.on_track_end(TrackEndReason::Cleanup).await.unwrap();

        assert_eq!(played(&h.node).as_deref(), Some("enc-b"));
        assert!(matches!(
            h.drain().as_slice(),
            [PlayerSignal::TrackErrored { kind: FaultKind::Cleanup, message, .. }] if message.contains("Track a")
        ));
    }

    #[tokio::test]
    async fn loop_queue_wraps_after_the_last_track() {
        let settings = GuildSettings {
            loop_state: LoopState::Queue,
            ..GuildSettings::default()
        };
        let mut h = harness_with(MockVoiceGateway::new(), MockSearchProvider::new(), settings);
        h.player
            .queue_mut()
            .add(vec![resolved("a"), resolved("b")], None)
            .unwrap();
        h.player.queue_mut().set_current_index(1);
        h.player.play().await.unwrap();

        h.player.on_track_end(TrackEndReason::Finished).await.unwrap();

        assert_eq!(h.player.queue().current_index(), 0);
        assert_eq!(played(&h.node).as_deref(), Some("enc-a"));
    }

    #[tokio::test]
    async fn autoplay_fills_from_recommendations() {
        let mut search = MockSearchProvider::new();
        search.expect_recommendations().times(1).returning(|_| {
            Ok(vec![
                result("short", 30_000),
                result("good", 200_000),
                result("long", 600_000),
            ])
        });
        let settings = GuildSettings {
            autoplay: true,
            ..GuildSettings::default()
        };
        let mut h = harness_with(MockVoiceGateway::new(), search, settings);
        h.player.queue_mut().add(vec![resolved("seed")], None).unwrap();
        h.player.play().await.unwrap();

        h.player.on_track_end(TrackEndReason::Finished).await.unwrap();

        assert_eq!(played(&h.node).as_deref(), Some("enc-good"));
        assert!(h.player.queue().recommendations().is_empty());
    }

    #[tokio::test]
    async fn setters_only_send_on_change() {
        let mut h = harness(MockVoiceGateway::new(), MockSearchProvider::new());

        assert!(h.player.set_volume(200).await.unwrap());
        assert_eq!(h.node.last(), Some(OutgoingOp::volume(GUILD, 100)));
        assert!(!h.player.set_volume(200).await.unwrap());
        assert!(matches!(
            h.player.set_volume(1001).await,
            Err(PlayerError::InvalidVolume(1001))
        ));

        assert!(h.player.pause(true).await.unwrap());
        assert!(!h.player.pause(true).await.unwrap());
        assert_eq!(h.node.ops(), vec!["volume", "pause"]);

        h.node.connected.store(false, Ordering::Relaxed);
        assert!(matches!(
            h.player.pause(false).await,
            Err(PlayerError::NodeUnavailable { .. })
        ));
        assert!(h.player.is_paused());
    }

    #[tokio::test]
    async fn seek_requires_seekable_and_clamps() {
        let mut h = harness(MockVoiceGateway::new(), MockSearchProvider::new());
        assert!(matches!(h.player.seek(10).await, Err(PlayerError::NothingToPlay)));

        let mut live = result("live", 0);
        live.is_seekable = false;
        h.player
            .queue_mut()
            .add(vec![Track::from(live), resolved("b")], None)
            .unwrap();
        assert!(matches!(h.player.seek(10).await, Err(PlayerError::NotSeekable)));

        h.player.queue_mut().set_current_index(1);
        assert!(h.player.seek(999_999).await.unwrap());
        assert_eq!(h.node.last(), Some(OutgoingOp::seek(GUILD, 200_000)));
    }

    #[tokio::test]
    async fn voice_update_completes_the_connection() {
        let mut gateway = MockVoiceGateway::new();
        gateway.expect_join().times(1).returning(|_, _| Ok(()));
        let settings = GuildSettings {
            volume_fraction: 1.5,
            ..GuildSettings::default()
        };
        let mut h = harness_with(gateway, MockSearchProvider::new(), settings);

        h.player.connect(ChannelId::new(5)).await.unwrap();
        assert_eq!(h.player.state(), ConnectionState::Connecting);
        h.player.connect(ChannelId::new(5)).await.unwrap();

        let update = VoiceUpdate {
            session_id: "sess".to_string(),
            event: VoiceServerEvent::new(GUILD, "tok", None),
        };
        assert!(h.player.on_voice_update(update).await);

        assert_eq!(h.player.state(), ConnectionState::Connected);
        assert_eq!(h.node.ops(), vec!["voiceUpdate", "volume"]);
    }

    #[tokio::test]
    async fn channel_transitions_emit_signals() {
        let mut h = harness(MockVoiceGateway::new(), MockSearchProvider::new());
        let a = ChannelId::new(1);
        let b = ChannelId::new(2);

        h.player.on_channel_transition(ChannelTransition::Connect(a));
        h.player.on_channel_transition(ChannelTransition::Move { from: a, to: b });
        assert_eq!(h.player.voice_channel_id(), Some(b));
        h.player.on_channel_transition(ChannelTransition::Disconnect(b));

        assert_eq!(h.player.state(), ConnectionState::Disconnected);
        let signals = h.drain();
        assert!(matches!(signals[0], PlayerSignal::Moved { from, to, .. } if from == a && to == b));
        assert!(matches!(signals[1], PlayerSignal::Disconnected { .. }));
    }

    #[tokio::test]
    async fn requested_disconnect_keeps_the_queue() {
        let mut gateway = MockVoiceGateway::new();
        gateway.expect_join().times(1).returning(|_, _| Ok(()));
        gateway.expect_leave().times(1).returning(|_| Ok(()));
        let mut h = harness(gateway, MockSearchProvider::new());
        let channel = ChannelId::new(4);
        h.player.queue_mut().add(vec![resolved("a"), resolved("b")], None).unwrap();

        h.player.connect(channel).await.unwrap();
        h.player.disconnect().await.unwrap();
        assert_eq!(h.player.state(), ConnectionState::Disconnecting);
        h.player.on_voice_state(None);

        assert_eq!(h.player.state(), ConnectionState::Disconnected);
        assert_eq!(h.player.voice_channel_id(), None);
        assert_eq!(h.player.queue().len(), 2);
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn switching_channels_confirms_without_new_server_update() {
        let mut gateway = MockVoiceGateway::new();
        gateway.expect_join().times(2).returning(|_, _| Ok(()));
        let mut h = harness(gateway, MockSearchProvider::new());
        let first = ChannelId::new(5);
        let second = ChannelId::new(6);

        h.player.connect(first).await.unwrap();
        h.player.on_voice_state(Some(first));
        let update = VoiceUpdate {
            session_id: "sess".to_string(),
            event: VoiceServerEvent::new(GUILD, "tok", None),
        };
        assert!(h.player.on_voice_update(update).await);
        assert_eq!(h.player.state(), ConnectionState::Connected);

        h.player.connect(second).await.unwrap();
        assert_eq!(h.player.state(), ConnectionState::Connecting);
        h.player.on_voice_state(Some(second));

        assert_eq!(h.player.state(), ConnectionState::Connected);
        assert_eq!(h.player.voice_channel_id(), Some(second));
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn two_idle_polls_signal_inactivity() {
        let mut gateway = MockVoiceGateway::new();
        gateway.expect_listeners().returning(|_, _| Some(0));
        let mut h = harness(gateway, MockSearchProvider::new());
        h.player.on_channel_transition(ChannelTransition::Connect(ChannelId::new(3)));

        assert!(!h.player.poll_inactivity());
        assert!(h.player.poll_inactivity());
        assert!(!h.player.poll_inactivity());
        assert!(matches!(h.drain().as_slice(), [PlayerSignal::Inactivity { .. }]));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let mut gateway = MockVoiceGateway::new();
        gateway.expect_leave().times(1).returning(|_| Ok(()));
        let mut h = harness(gateway, MockSearchProvider::new());
        h.player.on_channel_transition(ChannelTransition::Connect(ChannelId::new(3)));
        h.player.queue_mut().add(vec![resolved("a")], None).unwrap();

        let token = h.player.monitor_token();
        let registered = harness(MockVoiceGateway::new(), MockSearchProvider::new());
        h.registry.insert(GUILD, Arc::new(Mutex::new(registered.player)));

        h.player.destroy().await;
        h.player.destroy().await;

        assert!(token.is_cancelled());
        assert!(h.player.queue().is_empty());
        assert!(h.registry.is_empty());
        assert_eq!(h.node.ops(), vec!["destroy"]);
        assert!(matches!(h.player.play().await, Err(PlayerError::Destroyed)));
    }

    #[test]
    fn recommendation_filters() {
        assert!(RecommendationFilter::Literal.accepts(59_999));
        assert!(!RecommendationFilter::Literal.accepts(120_000));
        assert!(RecommendationFilter::Between.accepts(120_000));
        assert!(!RecommendationFilter::Between.accepts(59_999));
        assert!(!RecommendationFilter::Between.accepts(300_000));
        assert_eq!("between".parse::<RecommendationFilter>().unwrap(), RecommendationFilter::Between);
        assert!("otro".parse::<RecommendationFilter>().is_err());
    }
}
