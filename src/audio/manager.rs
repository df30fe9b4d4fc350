use dashmap::{mapref::entry::Entry, DashMap, DashSet};
use serenity::{
    model::id::{ChannelId, GuildId, UserId},
    prelude::TypeMapKey,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        limiter::ErrorLimiter,
        player::{
            spawn_inactivity_monitor, Player, PlayerContext, PlayerRegistry, PlayerSignal,
            PlayerTransport, RecommendationFilter, SharedPlayer, VoiceGateway,
        },
        voice::{PendingVoice, VoiceServerEvent, VoiceUpdate},
    },
    error::PlayerError,
    node::{NodeEvent, NodeMessage, NodePool},
    sources::SearchProvider,
    storage::{GuildSettings, SettingsProvider},
};

/// Parámetros de los players que crea el manager
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub inactivity_interval: Duration,
    pub recommendation_filter: RecommendationFilter,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            inactivity_interval: Duration::from_secs(300),
            recommendation_filter: RecommendationFilter::Literal,
        }
    }
}

/// Cola de eventos de nodo que se procesa en orden, independiente de las demás
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Mailbox {
    Guild(GuildId),
    Node(String),
}

impl Mailbox {
    fn of(message: &NodeMessage) -> Self {
        match message.event.guild_id() {
            Some(guild_id) => Self::Guild(guild_id),
            None => Self::Node(message.node.clone()),
        }
    }
}

/// Orquestador de audio: registro de players, voz y eventos de los nodos
pub struct AudioManager {
    user_id: UserId,
    pool: Arc<NodePool>,
    players: PlayerRegistry,
    pending_voice: DashMap<GuildId, PendingVoice>,
    mailboxes: DashMap<Mailbox, mpsc::UnboundedSender<NodeMessage>>,
    known_nodes: DashSet<String>,
    settings: Arc<dyn SettingsProvider>,
    ctx: PlayerContext,
    options: ManagerOptions,
}

impl TypeMapKey for AudioManager {
    type Value = Arc<AudioManager>;
}

impl AudioManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: UserId,
        pool: Arc<NodePool>,
        gateway: Arc<dyn VoiceGateway>,
        search: Arc<dyn SearchProvider>,
        settings: Arc<dyn SettingsProvider>,
        limiter: Arc<ErrorLimiter>,
        signals: mpsc::UnboundedSender<PlayerSignal>,
        options: ManagerOptions,
    ) -> Self {
        let players: PlayerRegistry = Arc::new(DashMap::new());
        let ctx = PlayerContext {
            gateway,
            search,
            limiter,
            signals,
            registry: players.clone(),
            recommendation_filter: options.recommendation_filter,
        };

        Self {
            user_id,
            pool,
            players,
            pending_voice: DashMap::new(),
            mailboxes: DashMap::new(),
            known_nodes: DashSet::new(),
            settings,
            ctx,
            options,
        }
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    pub fn limiter(&self) -> &Arc<ErrorLimiter> {
        &self.ctx.limiter
    }

    pub fn get_player(&self, guild_id: GuildId) -> Option<SharedPlayer> {
        self.players.get(&guild_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Devuelve el player del servidor, creándolo en el nodo menos cargado
    pub async fn create_player(&self, guild_id: GuildId) -> Result<SharedPlayer, PlayerError> {
        if let Some(existing) = self.get_player(guild_id) {
            return Ok(existing);
        }

        let node = self.pool.least_loaded()?;
        let settings = match self.settings.guild_settings(guild_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("⚠️ Configuración de guild {} no disponible: {}", guild_id, e);
                GuildSettings::default()
            }
        };

        let player = Player::new(guild_id, node.clone(), settings, self.ctx.clone());
        let token = player.monitor_token();
        let shared: SharedPlayer = Arc::new(Mutex::new(player));

        let shared = match self.players.entry(guild_id) {
            Entry::Occupied(entry) => return Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => Arc::clone(entry.insert(shared).value()),
        };

        spawn_inactivity_monitor(&shared, self.options.inactivity_interval, token);
        info!("🎧 Player creado para guild {} en nodo '{}'", guild_id, node.name());

        // eventos de voz que llegaron antes que el player
        let (channel_id, buffered) = self
            .pending_voice
            .get(&guild_id)
            .map(|pending| (pending.channel_id(), pending.undelivered()))
            .unwrap_or_default();
        if channel_id.is_some() || buffered.is_some() {
            let mut player = shared.lock().await;
            if channel_id.is_some() {
                player.on_voice_state(channel_id);
            }
            if let Some(update) = buffered {
                if player.on_voice_update(update.clone()).await {
                    self.mark_delivered(guild_id, update);
                }
            }
        }

        Ok(shared)
    }

    /// Destruye el player del servidor (si existe)
    pub async fn destroy_player(&self, guild_id: GuildId) {
        self.pending_voice.remove(&guild_id);
        self.mailboxes.remove(&Mailbox::Guild(guild_id));
        if let Some(player) = self.get_player(guild_id) {
            player.lock().await.destroy().await;
        }
    }

    // ---- gateway ----

    /// `VOICE_STATE_UPDATE`; sólo interesa el del propio bot
    pub async fn handle_voice_state(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        channel_id: Option<ChannelId>,
        session_id: &str,
    ) {
        if user_id != self.user_id {
            return;
        }

        let update = match channel_id {
            Some(channel) => {
                let mut pending = self.pending_voice.entry(guild_id).or_default();
                pending.set_channel(channel);
                pending.set_session(session_id)
            }
            None => {
                if let Some(mut pending) = self.pending_voice.get_mut(&guild_id) {
                    pending.clear();
                }
                None
            }
        };

        let Some(player) = self.get_player(guild_id) else {
            debug!("Estado de voz de guild {} sin player, queda en buffer", guild_id);
            return;
        };
        let mut player = player.lock().await;

        player.on_voice_state(channel_id);
        if let Some(update) = update {
            if player.on_voice_update(update.clone()).await {
                self.mark_delivered(guild_id, update);
            }
        }
    }

    /// `VOICE_SERVER_UPDATE`
    pub async fn handle_voice_server(&self, guild_id: GuildId, token: &str, endpoint: Option<String>) {
        let event = VoiceServerEvent::new(guild_id, token, endpoint);
        let update = self
            .pending_voice
            .entry(guild_id)
            .or_default()
            .set_server(event);

        if let Some(update) = update {
            self.deliver_voice(guild_id, update).await;
        }
    }

    async fn deliver_voice(&self, guild_id: GuildId, update: VoiceUpdate) {
        let Some(player) = self.get_player(guild_id) else {
            debug!("voiceUpdate de guild {} sin player, queda en buffer", guild_id);
            return;
        };
        if player.lock().await.on_voice_update(update.clone()).await {
            self.mark_delivered(guild_id, update);
        }
    }

    /// Sólo una actualización aceptada por un player deja de estar pendiente
    fn mark_delivered(&self, guild_id: GuildId, update: VoiceUpdate) {
        if let Some(mut pending) = self.pending_voice.get_mut(&guild_id) {
            pending.mark_delivered(update);
        }
    }

    // ---- nodos ----

    /// Reparte los eventos de todos los nodos en buzones por guild.
    /// Un player lento no retrasa a los demás ni a los eventos del nodo.
    pub fn spawn_dispatcher(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<NodeMessage>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                manager.dispatch(message);
            }
            manager.mailboxes.clear();
            debug!("Dispatcher de nodos terminado");
        })
    }

    fn dispatch(self: &Arc<Self>, message: NodeMessage) {
        let mailbox = Mailbox::of(&message);
        let sender = self
            .mailboxes
            .entry(mailbox.clone())
            .or_insert_with(|| self.spawn_mailbox(&mailbox))
            .value()
            .clone();

        let Err(mpsc::error::SendError(message)) = sender.send(message) else {
            return;
        };

        // el worker terminó: se reemplaza una vez
        let sender = self.spawn_mailbox(&mailbox);
        self.mailboxes.insert(mailbox.clone(), sender.clone());
        if sender.send(message).is_err() {
            warn!("⚠️ Evento de nodo descartado para {:?}", mailbox);
        }
    }

    fn spawn_mailbox(self: &Arc<Self>, mailbox: &Mailbox) -> mpsc::UnboundedSender<NodeMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = Arc::downgrade(self);
        let mailbox = mailbox.clone();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(manager) = manager.upgrade() else { break };
                manager.handle_node_message(message).await;
            }
            debug!("Buzón {:?} cerrado", mailbox);
        });
        tx
    }

    /// Cierra los buzones de guilds sin player y de nodos que ya no existen
    pub fn prune_mailboxes(&self) {
        let before = self.mailboxes.len();
        self.mailboxes.retain(|mailbox, _| match mailbox {
            Mailbox::Guild(guild_id) => self.players.contains_key(guild_id),
            Mailbox::Node(node) => self.pool.get(node).is_some(),
        });
        let pruned = before.saturating_sub(self.mailboxes.len());
        if pruned > 0 {
            debug!("🧹 {} buzones de eventos cerrados", pruned);
        }
    }

    pub async fn handle_node_message(&self, message: NodeMessage) {
        let NodeMessage { node, event } = message;

        if let Some(guild_id) = event.guild_id() {
            self.route_to_player(&node, guild_id, event).await;
            return;
        }

        match event {
            NodeEvent::Connected => {
                if !self.known_nodes.insert(node.clone()) {
                    self.resync_node(&node).await;
                }
            }
            NodeEvent::Reconnecting { attempt, .. } => {
                self.signal(PlayerSignal::NodeReconnecting { node, attempt });
            }
            NodeEvent::Closed { code, reason } => {
                debug!("Nodo '{}' cerrado: {} '{}'", node, code, reason);
            }
            NodeEvent::Fatal { reason } => {
                error!("❌ Nodo '{}' perdido: {}", node, reason);
                self.failover(&node).await;
            }
            _ => {}
        }
    }

    async fn route_to_player(&self, node: &str, guild_id: GuildId, event: NodeEvent) {
        let Some(player) = self.get_player(guild_id) else {
            debug!("Evento para guild {} sin player ignorado", guild_id);
            return;
        };
        let mut player = player.lock().await;

        if player.node_name() != node {
            debug!("Evento viejo del nodo '{}' para guild {} ignorado", node, guild_id);
            return;
        }

        let result = match event {
            NodeEvent::PlayerUpdate { position, .. } => {
                player.on_player_update(position);
                Ok(())
            }
            NodeEvent::TrackStart { .. } => {
                player.on_track_start();
                Ok(())
            }
            NodeEvent::TrackEnd { reason, .. } => player.on_track_end(reason).await,
            NodeEvent::TrackStuck { threshold_ms, .. } => player.on_track_stuck(threshold_ms).await,
            NodeEvent::TrackException { message, .. } => {
                player.on_track_exception(message).await;
                Ok(())
            }
            NodeEvent::SocketClosed {
                code,
                reason,
                by_remote,
                ..
            } => {
                player.on_socket_closed(code, &reason, by_remote);
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            warn!("⚠️ Guild {}: {}", guild_id, e);
        }
    }

    async fn players_on(&self, node: &str) -> Vec<SharedPlayer> {
        let all: Vec<SharedPlayer> = self
            .players
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut bound = Vec::new();
        for player in all {
            if player.lock().await.node_name() == node {
                bound.push(player);
            }
        }
        bound
    }

    async fn resync_node(&self, node: &str) {
        let players = self.players_on(node).await;
        info!("🔄 Nodo '{}' reconectado, resincronizando {} players", node, players.len());
        for player in players {
            player.lock().await.resync().await;
        }
    }

    /// Mueve los players de un nodo muerto a otro, o los destruye
    async fn failover(&self, node: &str) {
        self.pool.remove_node(node);
        self.known_nodes.remove(node);

        for player in self.players_on(node).await {
            let mut player = player.lock().await;
            match self.pool.least_loaded() {
                Ok(replacement) => {
                    let transport: Arc<dyn PlayerTransport> = replacement;
                    player.rebind(transport).await;
                }
                Err(_) => {
                    let guild_id = player.guild_id();
                    warn!("⚠️ Sin nodos para guild {}, destruyendo player", guild_id);
                    self.signal(PlayerSignal::NodeLost {
                        guild_id,
                        node: node.to_string(),
                    });
                    self.pending_voice.remove(&guild_id);
                    player.destroy().await;
                }
            }
        }
    }

    /// Destruye todos los players y nodos
    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.players.iter().map(|entry| *entry.key()).collect();
        for guild_id in guilds {
            self.destroy_player(guild_id).await;
        }
        self.mailboxes.clear();
        self.pool.shutdown();
        info!("👋 Audio manager detenido");
    }

    fn signal(&self, signal: PlayerSignal) {
        if let Err(e) = self.ctx.signals.send(signal) {
            debug!("Sin receptor para la señal {:?}", e.0);
        }
    }
}
