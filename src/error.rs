//! Errores tipados del motor de audio.
//!
//! Cada familia de fallo del orquestador tiene su propio enum para que la capa de
//! presentación decida qué mostrar. En el cableado de la aplicación (`main`, `bot`,
//! `storage`) se sigue usando `anyhow`.

use std::fmt;
use thiserror::Error;

/// Violaciones de invariantes de la cola. La cola queda intacta cuando se devuelven.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("índice {index} fuera de rango (longitud {len})")]
    OutOfBounds { index: usize, len: usize },

    #[error("no se puede insertar en {index}: la canción actual está en {current}")]
    BeforeCurrent { index: usize, current: usize },

    #[error("el rango {start}..={end} incluye la canción actual ({current})")]
    IncludesCurrent {
        start: usize,
        end: usize,
        current: usize,
    },

    #[error("rango inválido: inicio {start} >= fin {end}")]
    InvalidRange { start: usize, end: usize },

    #[error("no se pueden saltar {amount} canciones desde {current} (longitud {len})")]
    InvalidSkip {
        amount: usize,
        current: usize,
        len: usize,
    },
}

/// Un track no pudo convertirse en algo reproducible.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("sin resultados para '{query}'")]
    NoResults { query: String },

    #[error("error del proveedor de búsqueda: {0}")]
    Provider(#[from] anyhow::Error),
}

/// Fallos de conexión con los nodos de audio.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("no hay nodos de audio conectados")]
    NoAvailableNode,

    #[error("handshake inválido: {0}")]
    Handshake(String),

    #[error("error de websocket: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("error REST: {0}")]
    Rest(#[from] reqwest::Error),

    #[error("el nodo rechazó la carga: {0}")]
    LoadFailed(String),
}

/// Errores de las operaciones del player.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("no hay nada para reproducir")]
    NothingToPlay,

    #[error("el track actual no admite seek")]
    NotSeekable,

    #[error("volumen {0} fuera de rango (0-1000)")]
    InvalidVolume(u16),

    #[error("filtro inválido: {0}")]
    InvalidFilter(String),

    #[error("el nodo '{node}' no aceptó el comando")]
    NodeUnavailable { node: String },

    #[error("el player ya fue destruido")]
    Destroyed,

    #[error("se requiere un canal de voz")]
    NoVoiceChannel,

    #[error("error del gateway de voz: {0}")]
    Gateway(anyhow::Error),
}

/// Clase de fallo reportada en las señales hacia la capa de presentación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    Resolution,
    LoadFailed,
    Cleanup,
    Exception,
    Stuck,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FaultKind::Resolution => "resolution",
            FaultKind::LoadFailed => "load_failed",
            FaultKind::Cleanup => "cleanup",
            FaultKind::Exception => "exception",
            FaultKind::Stuck => "stuck",
        };
        f.write_str(label)
    }
}
