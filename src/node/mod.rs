//! Cliente de un nodo de audio (protocolo Lavalink v3).
//!
//! Cada [`Node`] mantiene un websocket autenticado con su servidor y lo
//! reconecta según su [`ReconnectPolicy`]. Todo lo que llega del nodo se
//! traduce a [`NodeEvent`]s y se publica en un canal compartido por todos los
//! nodos, que consume el dispatcher de [`AudioManager`](crate::audio::AudioManager).

pub mod pool;
pub mod protocol;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serenity::model::id::{GuildId, UserId};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    handshake::client::Request,
    http::HeaderValue,
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{config::NodeConfig, error::NodeError};
use protocol::{
    parse_guild_id, EventPayload, IncomingMessage, LoadResult, LoadType, OutgoingOp, StatsPayload,
    TrackEndReason,
};

pub use pool::NodePool;

/// Razón de cierre con la que se pide al nodo terminar para siempre
pub const DESTROY_REASON: &str = "destroy";

const ABNORMAL_CLOSE: u16 = 1006;
const NORMAL_CLOSE: u16 = 1000;
/// Tope para cada llamada REST; un nodo colgado no retiene al player
const REST_TIMEOUT: Duration = Duration::from_secs(10);

/// Estadísticas de carga que reporta el nodo; sólo se usan para elegir nodo
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    pub cpu_cores: u32,
    pub system_load: f64,
    pub process_load: f64,
    pub uptime_ms: u64,
}

impl NodeStats {
    /// Carga del sistema por núcleo; 0 si el nodo aún no reportó CPU
    pub fn load_score(&self) -> f64 {
        if self.cpu_cores == 0 {
            0.0
        } else {
            self.system_load / self.cpu_cores as f64
        }
    }

    fn merge(&mut self, payload: StatsPayload) {
        self.players = payload.players;
        self.playing_players = payload.playing_players;
        self.uptime_ms = payload.uptime;
        if let Some(cpu) = payload.cpu {
            self.cpu_cores = cpu.cores;
            self.system_load = cpu.system_load;
            self.process_load = cpu.lavalink_load;
        }
    }
}

/// Lo que un nodo informa al orquestador
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Closed { code: u16, reason: String },
    /// Se agotaron los reintentos; el nodo no vuelve
    Fatal { reason: String },
    PlayerUpdate { guild_id: GuildId, position: u64, time: u64 },
    TrackStart { guild_id: GuildId, track: Option<String> },
    TrackEnd { guild_id: GuildId, reason: TrackEndReason },
    TrackStuck { guild_id: GuildId, threshold_ms: u64 },
    TrackException { guild_id: GuildId, message: String },
    SocketClosed { guild_id: GuildId, code: u16, reason: String, by_remote: bool },
}

impl NodeEvent {
    pub fn guild_id(&self) -> Option<GuildId> {
        match self {
            Self::PlayerUpdate { guild_id, .. }
            | Self::TrackStart { guild_id, .. }
            | Self::TrackEnd { guild_id, .. }
            | Self::TrackStuck { guild_id, .. }
            | Self::TrackException { guild_id, .. }
            | Self::SocketClosed { guild_id, .. } => Some(*guild_id),
            _ => None,
        }
    }
}

/// Evento etiquetado con el nodo que lo produjo
#[derive(Debug, Clone)]
pub struct NodeMessage {
    pub node: String,
    pub event: NodeEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Cierre pedido explícitamente; no reconectar
    Stop,
    Retry(Duration),
    /// Reintentos agotados
    GiveUp,
}

/// Política de reconexión con retardo fijo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// `attempts` son los reintentos hechos desde la última conexión exitosa
    pub fn on_close(&self, code: u16, reason: &str, attempts: u32) -> CloseAction {
        if code == NORMAL_CLOSE && reason == DESTROY_REASON {
            CloseAction::Stop
        } else if attempts >= self.max_attempts {
            CloseAction::GiveUp
        } else {
            CloseAction::Retry(self.delay)
        }
    }
}

#[derive(Debug)]
struct SessionEnd {
    opened: bool,
    code: u16,
    reason: String,
}

impl SessionEnd {
    fn abnormal(opened: bool, reason: impl Into<String>) -> Self {
        Self {
            opened,
            code: ABNORMAL_CLOSE,
            reason: reason.into(),
        }
    }
}

/// Conexión con un nodo de audio
#[derive(Debug)]
pub struct Node {
    config: NodeConfig,
    user_id: UserId,
    shard_count: u32,
    policy: ReconnectPolicy,
    connected: AtomicBool,
    stats: RwLock<NodeStats>,
    rest_calls: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events: mpsc::UnboundedSender<NodeMessage>,
    cancel: CancellationToken,
    http: reqwest::Client,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        user_id: UserId,
        shard_count: u32,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<NodeMessage>,
    ) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("⚠️ Cliente HTTP con timeout no disponible ({}), usando el por defecto", e);
                reqwest::Client::new()
            });

        Arc::new(Self {
            config,
            user_id,
            shard_count,
            policy,
            connected: AtomicBool::new(false),
            stats: RwLock::new(NodeStats::default()),
            rest_calls: AtomicU64::new(0),
            outbound: Mutex::new(None),
            events,
            cancel: CancellationToken::new(),
            http,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// El nodo fue destruido o agotó sus reintentos
    pub fn is_destroyed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stats(&self) -> NodeStats {
        *self.stats.read()
    }

    pub fn rest_calls(&self) -> u64 {
        self.rest_calls.load(Ordering::Relaxed)
    }

    /// Inicia la tarea de conexión/reconexión
    pub fn connect(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move { node.run().await })
    }

    /// Cierra con `1000 "destroy"`; el nodo no reconecta
    pub fn destroy(&self) {
        if !self.cancel.is_cancelled() {
            info!("🛑 Destruyendo nodo '{}'", self.config.name);
            self.cancel.cancel();
        }
        self.connected.store(false, Ordering::Release);
    }

    /// Simula una sesión abierta; los mensajes salientes llegan al receptor
    #[cfg(test)]
    pub(crate) fn open_for_tests(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        self.connected.store(true, Ordering::Release);
        rx
    }

    /// Envía un op. Devuelve `false` si el nodo no está conectado.
    pub fn send(&self, op: &OutgoingOp) -> bool {
        if !self.is_connected() {
            debug!("📭 Nodo '{}' desconectado, op '{}' descartado", self.config.name, op.name());
            return false;
        }

        let json = match serde_json::to_string(op) {
            Ok(json) => json,
            Err(e) => {
                error!("❌ No se pudo serializar op '{}': {}", op.name(), e);
                return false;
            }
        };

        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(Message::Text(json.into())).is_ok(),
            None => false,
        }
    }

    /// `GET /loadtracks?identifier=...`
    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult, NodeError> {
        self.rest_calls.fetch_add(1, Ordering::Relaxed);

        let url = self
            .config
            .rest_url("loadtracks")
            .map_err(|e| NodeError::Handshake(format!("URL inválida: {}", e)))?;

        let result: LoadResult = self
            .http
            .get(url)
            .query(&[("identifier", identifier)])
            .header(reqwest::header::AUTHORIZATION, &self.config.password)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if result.load_type == LoadType::LoadFailed {
            let message = result
                .exception
                .and_then(|e| e.message)
                .unwrap_or_else(|| "sin detalle".to_string());
            warn!("⚠️ Nodo '{}' no pudo cargar '{}': {}", self.config.name, identifier, message);
            return Err(NodeError::LoadFailed(message));
        }

        debug!(
            "🔎 '{}' -> {:?} ({} tracks) en nodo '{}'",
            identifier,
            result.load_type,
            result.tracks.len(),
            self.config.name
        );
        Ok(result)
    }

    async fn run(self: Arc<Self>) {
        let mut attempts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let end = match self.session().await {
                Ok(end) => end,
                Err(e) => {
                    warn!("⚠️ No se pudo conectar al nodo '{}': {}", self.config.name, e);
                    SessionEnd::abnormal(false, e.to_string())
                }
            };

            self.connected.store(false, Ordering::Release);
            *self.outbound.lock() = None;

            if end.opened {
                attempts = 0;
            }
            if self.cancel.is_cancelled() {
                break;
            }

            self.emit(NodeEvent::Closed {
                code: end.code,
                reason: end.reason.clone(),
            });

            match self.policy.on_close(end.code, &end.reason, attempts) {
                CloseAction::Stop => {
                    info!("🔌 Nodo '{}' cerrado con '{}'", self.config.name, end.reason);
                    self.cancel.cancel();
                    break;
                }
                CloseAction::GiveUp => {
                    error!(
                        "❌ Nodo '{}' sin reconexión tras {} intentos",
                        self.config.name, attempts
                    );
                    self.cancel.cancel();
                    self.emit(NodeEvent::Fatal { reason: end.reason });
                    break;
                }
                CloseAction::Retry(delay) => {
                    attempts += 1;
                    warn!(
                        "🔄 Nodo '{}' cerrado ({} '{}'), reintento {} en {:?}",
                        self.config.name, end.code, end.reason, attempts, delay
                    );
                    self.emit(NodeEvent::Reconnecting {
                        attempt: attempts,
                        delay,
                    });

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        debug!("Tarea del nodo '{}' terminada", self.config.name);
    }

    async fn session(&self) -> Result<SessionEnd, NodeError> {
        let request = self.handshake_request()?;
        debug!("Conectando a nodo '{}' en {}", self.config.name, self.config.ws_url());

        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut write, mut read) = stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock() = Some(tx);
        self.connected.store(true, Ordering::Release);
        info!("✅ Nodo '{}' conectado", self.config.name);
        self.emit(NodeEvent::Connected);

        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: String::from(DESTROY_REASON).into(),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        debug!("Cierre del nodo '{}' sin confirmar: {}", self.config.name, e);
                    }
                    break SessionEnd {
                        opened: true,
                        code: NORMAL_CLOSE,
                        reason: DESTROY_REASON.to_string(),
                    };
                }
                Some(outgoing) = rx.recv() => {
                    if let Err(e) = write.send(outgoing).await {
                        warn!("⚠️ Error de escritura en nodo '{}': {}", self.config.name, e);
                        break SessionEnd::abnormal(true, e.to_string());
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|cf| (cf.code.into(), cf.reason.to_string()))
                                .unwrap_or((ABNORMAL_CLOSE, String::new()));
                            break SessionEnd { opened: true, code, reason };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("⚠️ Error de lectura en nodo '{}': {}", self.config.name, e);
                            break SessionEnd::abnormal(true, e.to_string());
                        }
                        None => break SessionEnd::abnormal(true, "stream terminado"),
                    }
                }
            }
        };

        Ok(end)
    }

    fn handshake_request(&self) -> Result<Request, NodeError> {
        let mut request = self.config.ws_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Authorization", header_value(&self.config.password)?);
        headers.insert("Num-Shards", header_value(&self.shard_count.to_string())?);
        headers.insert("User-Id", header_value(&self.user_id.to_string())?);
        headers.insert(
            "Client-Name",
            header_value(concat!("open-music-engine/", env!("CARGO_PKG_VERSION")))?,
        );
        Ok(request)
    }

    /// Procesa un mensaje de texto del nodo
    pub(crate) fn handle_text(&self, text: &str) {
        let message: IncomingMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("⚠️ Mensaje inválido del nodo '{}': {}", self.config.name, e);
                return;
            }
        };

        match message {
            IncomingMessage::Stats(payload) => self.stats.write().merge(payload),
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                if let Some(guild_id) = parse_guild_id(&guild_id) {
                    self.emit(NodeEvent::PlayerUpdate {
                        guild_id,
                        position: state.position,
                        time: state.time,
                    });
                }
            }
            IncomingMessage::Event(payload) => match track_event(payload) {
                Some(event) => self.emit(event),
                None => debug!("Evento desconocido del nodo '{}' ignorado", self.config.name),
            },
            IncomingMessage::Unknown => {
                debug!("Op desconocido del nodo '{}' ignorado", self.config.name)
            }
        }
    }

    fn emit(&self, event: NodeEvent) {
        let message = NodeMessage {
            node: self.config.name.clone(),
            event,
        };
        if self.events.send(message).is_err() {
            debug!("Dispatcher cerrado; evento del nodo '{}' perdido", self.config.name);
        }
    }
}

fn track_event(payload: EventPayload) -> Option<NodeEvent> {
    let guild_id = parse_guild_id(payload.guild_id()?)?;

    let event = match payload {
        EventPayload::TrackStart { track, .. } => NodeEvent::TrackStart { guild_id, track },
        EventPayload::TrackEnd { reason, .. } => NodeEvent::TrackEnd { guild_id, reason },
        EventPayload::TrackStuck { threshold_ms, .. } => NodeEvent::TrackStuck {
            guild_id,
            threshold_ms,
        },
        EventPayload::TrackException {
            exception, error, ..
        } => NodeEvent::TrackException {
            guild_id,
            message: exception
                .and_then(|e| e.message)
                .or(error)
                .unwrap_or_else(|| "error desconocido".to_string()),
        },
        EventPayload::WebSocketClosed {
            code,
            reason,
            by_remote,
            ..
        } => NodeEvent::SocketClosed {
            guild_id,
            code,
            reason,
            by_remote,
        },
        EventPayload::Unknown => return None,
    };

    Some(event)
}

fn header_value(value: &str) -> Result<HeaderValue, NodeError> {
    HeaderValue::from_str(value).map_err(|e| NodeError::Handshake(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node_at(port: u16, policy: ReconnectPolicy) -> (Arc<Node>, mpsc::UnboundedReceiver<NodeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = NodeConfig {
            name: "lost".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            password: "youshallnotpass".to_string(),
            secure: false,
        };
        (Node::new(config, UserId::new(1), 1, policy, tx), rx)
    }

    #[tokio::test]
    async fn unreachable_node_retries_then_fails() {
        // puerto libre sin nadie escuchando
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let policy = ReconnectPolicy {
            delay: Duration::from_millis(10),
            max_attempts: 2,
        };
        let (node, mut rx) = node_at(port, policy);

        tokio::time::timeout(Duration::from_secs(5), node.connect())
            .await
            .expect("la tarea del nodo no terminó")
            .unwrap();

        let events: Vec<NodeEvent> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|message| {
                assert_eq!(message.node, "lost");
                message.event
            })
            .collect();
        let closed = |event: &NodeEvent| matches!(event, NodeEvent::Closed { code: 1006, .. });

        assert_eq!(events.len(), 6);
        assert!(closed(&events[0]));
        assert!(matches!(events[1], NodeEvent::Reconnecting { attempt: 1, delay } if delay == policy.delay));
        assert!(closed(&events[2]));
        assert!(matches!(events[3], NodeEvent::Reconnecting { attempt: 2, .. }));
        assert!(closed(&events[4]));
        assert!(matches!(events[5], NodeEvent::Fatal { .. }));
        assert!(node.is_destroyed());
        assert!(!node.is_connected());
    }

    fn test_node() -> (Arc<Node>, mpsc::UnboundedReceiver<NodeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = NodeConfig {
            name: "main".to_string(),
            host: "localhost".to_string(),
            port: 2333,
            password: "youshallnotpass".to_string(),
            secure: false,
        };
        let node = Node::new(config, UserId::new(1), 1, ReconnectPolicy::default(), tx);
        (node, rx)
    }

    #[test]
    fn abnormal_close_is_retried() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.on_close(1006, "", 0),
            CloseAction::Retry(Duration::from_secs(5))
        );
        assert_eq!(
            policy.on_close(1000, "bye", 2),
            CloseAction::Retry(Duration::from_secs(5))
        );
    }

    #[test]
    fn destroy_close_is_never_retried() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.on_close(1000, "destroy", 0), CloseAction::Stop);
        assert_eq!(policy.on_close(1000, "destroy", 99), CloseAction::Stop);
    }

    #[test]
    fn exhausted_attempts_give_up() {
        let policy = ReconnectPolicy {
            delay: Duration::from_millis(10),
            max_attempts: 3,
        };
        assert_eq!(policy.on_close(1006, "", 2), CloseAction::Retry(Duration::from_millis(10)));
        assert_eq!(policy.on_close(1006, "", 3), CloseAction::GiveUp);
    }

    #[test]
    fn stats_are_merged() {
        let (node, _rx) = test_node();
        node.handle_text(
            r#"{"op":"stats","players":2,"playingPlayers":1,"uptime":5,"cpu":{"cores":4,"systemLoad":2.0,"lavalinkLoad":0.3}}"#,
        );

        let stats = node.stats();
        assert_eq!(stats.players, 2);
        assert_eq!(stats.cpu_cores, 4);
        assert_eq!(stats.load_score(), 0.5);
    }

    #[test]
    fn track_events_are_forwarded_in_order() {
        let (node, mut rx) = test_node();
        node.handle_text(r#"{"op":"event","type":"TrackStartEvent","guildId":"9","track":"QA"}"#);
        node.handle_text(
            r#"{"op":"event","type":"TrackExceptionEvent","guildId":"9","exception":{"message":"boom","severity":"COMMON"}}"#,
        );
        node.handle_text(r#"{"op":"event","type":"TrackEndEvent","guildId":"9","reason":"LOAD_FAILED"}"#);
        node.handle_text(r#"{"op":"event","type":"TrackEndEvent","guildId":"0","reason":"FINISHED"}"#);
        node.handle_text("no es json");

        let guild_id = GuildId::new(9);
        let events: Vec<NodeEvent> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|message| message.event)
            .collect();
        assert_eq!(
            events,
            vec![
                NodeEvent::TrackStart {
                    guild_id,
                    track: Some("QA".to_string())
                },
                NodeEvent::TrackException {
                    guild_id,
                    message: "boom".to_string()
                },
                NodeEvent::TrackEnd {
                    guild_id,
                    reason: TrackEndReason::LoadFailed
                },
            ]
        );
    }

    #[test]
    fn send_fails_while_disconnected() {
        let (node, _rx) = test_node();
        assert!(!node.send(&OutgoingOp::stop(GuildId::new(9))));

        node.destroy();
        assert!(node.is_destroyed());
        assert!(!node.is_connected());
    }
}
