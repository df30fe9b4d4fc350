use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::{SearchProvider, SearchResult};
use crate::{
    audio::track::Track,
    cache::{cache_key, SearchCache},
    node::{protocol::LoadType, NodePool},
};

/// Proveedor de búsqueda que usa el endpoint `/loadtracks` del nodo menos cargado
pub struct NodeSearch {
    pool: Arc<NodePool>,
    cache: SearchCache,
}

impl NodeSearch {
    pub fn new(pool: Arc<NodePool>, cache: SearchCache) -> Self {
        Self { pool, cache }
    }

    pub fn cache(&self) -> &SearchCache {
        &self.cache
    }

    async fn load(&self, identifier: &str) -> Result<Vec<SearchResult>> {
        let node = self.pool.least_loaded()?;
        let result = node.load_tracks(identifier).await?;

        let tracks = match result.load_type {
            LoadType::NoMatches => Vec::new(),
            _ => result.tracks.into_iter().map(SearchResult::from).collect(),
        };
        Ok(tracks)
    }
}

/// Texto libre se busca en YouTube; URLs se pasan tal cual
pub fn search_identifier(query: &str) -> String {
    let query = query.trim();
    if query.starts_with("http://") || query.starts_with("https://") {
        query.to_string()
    } else {
        format!("ytsearch:{}", query)
    }
}

/// Playlist "mix" de YouTube generada a partir de un video
pub fn mix_identifier(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={0}&list=RD{0}", video_id)
}

#[async_trait]
impl SearchProvider for NodeSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let key = cache_key(query);
        if let Some(cached) = self.cache.get(&key) {
            debug!("🎯 Cache hit para '{}'", query);
            return Ok(cached);
        }

        let results = self.load(&search_identifier(query)).await?;
        if !results.is_empty() {
            self.cache.insert(key, results.clone());
        }

        info!("🔍 '{}': {} resultados", query, results.len());
        Ok(results)
    }

    async fn recommendations(&self, seed: &Track) -> Result<Vec<SearchResult>> {
        let video_id = match seed.playable() {
            Some(playable) if playable.source_name == "youtube" => playable.identifier.clone(),
            _ => match self.search(&seed.search_query()).await?.into_iter().next() {
                Some(first) => first.identifier,
                None => return Ok(Vec::new()),
            },
        };

        let related: Vec<SearchResult> = self
            .load(&mix_identifier(&video_id))
            .await?
            .into_iter()
            .filter(|result| result.identifier != video_id)
            .collect();

        debug!("🎲 {} recomendaciones para '{}'", related.len(), seed.title());
        Ok(related)
    }
}
