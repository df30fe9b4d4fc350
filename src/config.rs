use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};
use url::Url;

use crate::{audio::player::RecommendationFilter, node::ReconnectPolicy};

/// Datos de conexión de un nodo de audio
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub secure: bool,
}

impl NodeConfig {
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn rest_url(&self, path: &str) -> Result<Url, url::ParseError> {
        let scheme = if self.secure { "https" } else { "http" };
        Url::parse(&format!("{}://{}:{}/", scheme, self.host, self.port))?.join(path)
    }
}

impl FromStr for NodeConfig {
    type Err = anyhow::Error;

    /// `name=host:port:password[:secure]`
    fn from_str(entry: &str) -> Result<Self> {
        let (name, rest) = entry
            .trim()
            .split_once('=')
            .with_context(|| format!("Nodo sin nombre: '{}'", entry))?;

        let mut parts = rest.splitn(4, ':');
        let host = parts.next().unwrap_or_default();
        let port = parts
            .next()
            .with_context(|| format!("Nodo '{}' sin puerto", name))?
            .parse::<u16>()
            .with_context(|| format!("Puerto inválido en nodo '{}'", name))?;
        let password = parts
            .next()
            .with_context(|| format!("Nodo '{}' sin contraseña", name))?;
        let secure = match parts.next() {
            Some(flag) => flag
                .parse::<bool>()
                .with_context(|| format!("Flag secure inválido en nodo '{}'", name))?,
            None => false,
        };

        if name.trim().is_empty() || host.trim().is_empty() {
            anyhow::bail!("Nodo inválido: '{}'", entry);
        }

        Ok(Self {
            name: name.trim().to_string(),
            host: host.trim().to_string(),
            port,
            password: password.to_string(),
            secure,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub shard_count: u32,

    // Nodos de audio
    pub nodes: Vec<NodeConfig>,
    pub reconnect_delay_secs: u64,
    pub reconnect_attempts: u32,

    // Player
    pub default_volume: f32, // Fracción 0.0-5.0
    pub inactivity_interval_secs: u64,
    pub error_ceiling: u32,
    pub error_window_secs: u64,

    // Búsqueda
    pub search_cache_size: usize,
    pub search_cache_ttl_secs: u64,

    // Paths
    pub data_dir: PathBuf,

    // Features
    pub enable_autoplay: bool,
    pub recommendation_filter: RecommendationFilter,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("No se pudo crear {}", config.data_dir.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Construye la configuración a partir de una función de búsqueda de variables
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let nodes = match lookup("LAVALINK_NODES").filter(|s| !s.trim().is_empty()) {
            Some(list) => parse_nodes(&list)?,
            None => vec![NodeConfig {
                name: "main".to_string(),
                host: var("LAVALINK_HOST", "localhost"),
                port: var("LAVALINK_PORT", "2333")
                    .parse()
                    .context("LAVALINK_PORT inválido")?,
                password: var("LAVALINK_PASSWORD", "youshallnotpass"),
                secure: var("LAVALINK_SECURE", "false")
                    .parse()
                    .context("LAVALINK_SECURE inválido")?,
            }],
        };

        Ok(Self {
            // Discord
            discord_token: lookup("DISCORD_TOKEN").context("DISCORD_TOKEN no definido")?,
            shard_count: var("SHARD_COUNT", "1").parse().context("SHARD_COUNT inválido")?,

            // Nodos
            nodes,
            reconnect_delay_secs: var("NODE_RECONNECT_DELAY", "5")
                .parse()
                .context("NODE_RECONNECT_DELAY inválido")?,
            reconnect_attempts: var("NODE_RECONNECT_ATTEMPTS", "5")
                .parse()
                .context("NODE_RECONNECT_ATTEMPTS inválido")?,

            // Player
            default_volume: var("DEFAULT_VOLUME", "0.5")
                .parse()
                .context("DEFAULT_VOLUME inválido")?,
            inactivity_interval_secs: var("INACTIVITY_INTERVAL", "300")
                .parse()
                .context("INACTIVITY_INTERVAL inválido")?,
            error_ceiling: var("ERROR_CEILING", "3").parse().context("ERROR_CEILING inválido")?,
            error_window_secs: var("ERROR_WINDOW", "10")
                .parse()
                .context("ERROR_WINDOW inválido")?,

            // Búsqueda
            search_cache_size: var("SEARCH_CACHE_SIZE", "500")
                .parse()
                .context("SEARCH_CACHE_SIZE inválido")?,
            search_cache_ttl_secs: var("SEARCH_CACHE_TTL", "600")
                .parse()
                .context("SEARCH_CACHE_TTL inválido")?,

            // Paths
            data_dir: var("DATA_DIR", "/app/data").into(),

            // Features
            enable_autoplay: var("ENABLE_AUTOPLAY", "false")
                .parse()
                .context("ENABLE_AUTOPLAY inválido")?,
            recommendation_filter: var("RECOMMENDATION_FILTER", "literal").parse()?,
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// Catches common mistakes before any node connection is attempted.
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN must not be empty");
        }

        if self.nodes.is_empty() {
            anyhow::bail!("At least one audio node must be configured");
        }

        let mut names: Vec<&str> = self.nodes.iter().map(|n| n.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            anyhow::bail!("Audio node names must be unique");
        }

        if self.shard_count == 0 {
            anyhow::bail!("Shard count must be greater than 0");
        }

        if !(0.0..=5.0).contains(&self.default_volume) {
            anyhow::bail!("Default volume must be between 0.0 and 5.0, got: {}", self.default_volume);
        }

        if self.inactivity_interval_secs == 0 {
            anyhow::bail!("Inactivity interval must be greater than 0");
        }

        if self.error_window_secs == 0 {
            anyhow::bail!("Error window must be greater than 0");
        }

        if self.search_cache_size == 0 {
            anyhow::bail!("Search cache size must be greater than 0");
        }

        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_secs(self.reconnect_delay_secs),
            max_attempts: self.reconnect_attempts,
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Node passwords and the Discord token are never included.
    pub fn summary(&self) -> String {
        let nodes = self
            .nodes
            .iter()
            .map(|n| format!("{}@{}:{}", n.name, n.host, n.port))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "Config Summary:\n  \
            Discord: {} shard(s)\n  \
            Nodes: {} (retry every {}s, max {} attempts)\n  \
            Player: {}% vol, inactivity {}s, errors {}/{}s\n  \
            Search cache: {} entries, {}s TTL\n  \
            Features: Autoplay={} ({:?})",
            self.shard_count,
            nodes,
            self.reconnect_delay_secs,
            self.reconnect_attempts,
            (self.default_volume * 100.0) as u32,
            self.inactivity_interval_secs,
            self.error_ceiling,
            self.error_window_secs,
            self.search_cache_size,
            self.search_cache_ttl_secs,
            self.enable_autoplay,
            self.recommendation_filter
        )
    }
}

/// `LAVALINK_NODES`: entradas separadas por `;`
pub fn parse_nodes(list: &str) -> Result<Vec<NodeConfig>> {
    list.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(NodeConfig::from_str)
        .collect()
}
