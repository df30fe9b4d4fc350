//! Contrato con el proveedor de búsqueda.
//!
//! El motor no descubre canciones por su cuenta: recibe resultados de un
//! [`SearchProvider`] y los convierte en [`Track`](crate::audio::track::Track)s.
//! La implementación por defecto consulta el endpoint REST de los nodos de audio.

pub mod node_search;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::audio::track::Track;

pub use node_search::NodeSearch;

/// Resultado de búsqueda tal como lo entrega el proveedor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub author: Option<String>,
    pub duration_ms: u64,
    pub is_seekable: bool,
    pub is_stream: bool,
    /// Handle reproducible (track codificado del nodo)
    pub encoded: String,
    pub uri: Option<String>,
    pub identifier: String,
    pub source_name: String,
}

/// Trait común para cualquier fuente de búsqueda
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Busca texto libre o una URL. Cero resultados no es un error.
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>>;

    /// Canciones relacionadas con `seed`, sin incluir la semilla
    async fn recommendations(&self, seed: &Track) -> Result<Vec<SearchResult>>;
}
