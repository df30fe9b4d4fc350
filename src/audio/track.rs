use chrono::{DateTime, Utc};
use serenity::model::id::UserId;
use tracing::{debug, info};

use crate::{
    error::ResolutionError,
    sources::{SearchProvider, SearchResult},
};

/// Ancho máximo del título que ve el usuario
pub const DISPLAY_TITLE_WIDTH: usize = 39;

/// Tolerancia de duración al elegir un resultado de búsqueda
const DURATION_TOLERANCE_MS: u64 = 1500;

/// Datos que el nodo necesita para reproducir
#[derive(Debug, Clone, PartialEq)]
pub struct Playable {
    pub encoded: String,
    pub is_seekable: bool,
    pub is_stream: bool,
    pub identifier: String,
    pub source_name: String,
}

/// Un elemento de la cola, resuelto o no.
///
/// Un track sin resolver sólo lleva metadatos (por ejemplo, lo que devuelve un
/// catálogo externo). [`Track::resolve`] lo convierte una única vez en un track
/// con handle reproducible; después de eso los metadatos quedan fijos.
#[derive(Debug, Clone)]
pub struct Track {
    title: String,
    artist: String,
    duration_ms: u64,
    uri: String,
    display_title: String,
    playable: Option<Playable>,
    requester: Option<UserId>,
    added_at: DateTime<Utc>,
}

impl Track {
    /// Crea un track liviano, sin handle reproducible
    pub fn unresolved(
        title: impl Into<String>,
        artist: impl Into<String>,
        duration_ms: u64,
        uri: impl Into<String>,
    ) -> Self {
        let title = title.into();
        Self {
            display_title: display_title(&title),
            title,
            artist: artist.into(),
            duration_ms,
            uri: uri.into(),
            playable: None,
            requester: None,
            added_at: Utc::now(),
        }
    }

    pub fn with_requester(mut self, user_id: UserId) -> Self {
        self.requester = Some(user_id);
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn artist(&self) -> &str {
        &self.artist
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Título escapado para markdown y recortado; no volver a escapar
    pub fn display_title(&self) -> &str {
        &self.display_title
    }

    pub fn playable(&self) -> Option<&Playable> {
        self.playable.as_ref()
    }

    pub fn requester(&self) -> Option<UserId> {
        self.requester
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    pub fn is_resolved(&self) -> bool {
        self.playable.is_some()
    }

    pub fn is_seekable(&self) -> bool {
        self.playable.as_ref().is_some_and(|p| p.is_seekable)
    }

    pub fn is_stream(&self) -> bool {
        self.playable.as_ref().is_some_and(|p| p.is_stream)
    }

    /// Texto que se envía al proveedor al resolver
    pub fn search_query(&self) -> String {
        if self.artist.trim().is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.title, self.artist)
        }
    }

    /// Resuelve el track contra el proveedor. Idempotente: si ya está
    /// resuelto no consulta nada.
    pub async fn resolve(
        &mut self,
        provider: &dyn SearchProvider,
    ) -> Result<&Self, ResolutionError> {
        if self.is_resolved() {
            return Ok(self);
        }

        let query = self.search_query();
        debug!("🔍 Resolviendo track: {}", query);

        let mut results = provider.search(&query).await?;
        if results.is_empty() {
            return Err(ResolutionError::NoResults { query });
        }

        let index = self.best_match(&results);
        let chosen = results.swap_remove(index);
        info!("✅ Track resuelto: '{}' -> '{}'", query, chosen.title);
        self.apply(chosen);

        Ok(self)
    }

    /// Elige el resultado más parecido: autor/título exacto, luego duración,
    /// luego el primero.
    fn best_match(&self, results: &[SearchResult]) -> usize {
        let artist = self.artist.trim().to_lowercase();
        let topic = format!("{} - topic", artist);

        let exact = results.iter().position(|result| {
            let author = result.author.as_deref().unwrap_or_default().to_lowercase();
            let author_match = !artist.is_empty() && (author == artist || author == topic);
            author_match || result.title == self.title
        });
        if let Some(index) = exact {
            return index;
        }

        if self.duration_ms > 0 {
            let close = results.iter().position(|result| {
                result.duration_ms.abs_diff(self.duration_ms) <= DURATION_TOLERANCE_MS
            });
            if let Some(index) = close {
                return index;
            }
        }

        0
    }

    fn apply(&mut self, result: SearchResult) {
        self.title = result.title;
        if let Some(author) = result.author {
            self.artist = author;
        }
        self.duration_ms = result.duration_ms;
        if let Some(uri) = result.uri {
            self.uri = uri;
        }
        self.display_title = display_title(&self.title);
        self.playable = Some(Playable {
            encoded: result.encoded,
            is_seekable: result.is_seekable,
            is_stream: result.is_stream,
            identifier: result.identifier,
            source_name: result.source_name,
        });
    }
}

impl From<SearchResult> for Track {
    fn from(result: SearchResult) -> Self {
        let mut track = Track::unresolved(
            result.title.clone(),
            result.author.clone().unwrap_or_default(),
            result.duration_ms,
            result.uri.clone().unwrap_or_default(),
        );
        track.apply(result);
        track
    }
}

/// Recorta a [`DISPLAY_TITLE_WIDTH`] caracteres visibles y escapa markdown
pub fn display_title(raw: &str) -> String {
    let visible: String = if raw.chars().count() > DISPLAY_TITLE_WIDTH {
        let mut cut: String = raw.chars().take(DISPLAY_TITLE_WIDTH - 1).collect();
        cut.push('…');
        cut
    } else {
        raw.to_string()
    };

    escape_markdown(&visible)
}

fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '*' | '_' | '~' | '`' | '|' | '>' | '[' | ']') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
