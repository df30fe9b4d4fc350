use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::audio::{filters::Filters, queue::LoopState};

/// Preferencias de reproducción de un servidor, leídas al crear su player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildSettings {
    pub guild_id: u64,
    pub loop_state: LoopState,
    pub volume_fraction: f32,
    pub filters: Filters,
    pub autoplay: bool,
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self {
            guild_id: 0,
            loop_state: LoopState::Disabled,
            volume_fraction: 0.5,
            filters: Filters::default(),
            autoplay: false,
        }
    }
}

/// Fuente de configuración por servidor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn guild_settings(&self, guild_id: GuildId) -> Result<GuildSettings>;
}

/// Manager de almacenamiento basado en archivos JSON
#[derive(Debug)]
pub struct JsonStorage {
    data_dir: PathBuf,
    defaults: GuildSettings,
    guilds_cache: DashMap<u64, GuildSettings>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf, defaults: GuildSettings) -> Result<Self> {
        let guilds_dir = data_dir.join("guilds");
        fs::create_dir_all(&guilds_dir)
            .await
            .with_context(|| format!("No se pudo crear {}", guilds_dir.display()))?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        let storage = Self {
            data_dir,
            defaults,
            guilds_cache: DashMap::new(),
        };
        storage.load_all_guilds().await?;

        Ok(storage)
    }

    /// Obtiene la configuración de un servidor; los servidores sin archivo
    /// reciben los valores por defecto
    pub async fn get_settings(&self, guild_id: u64) -> Result<GuildSettings> {
        if let Some(settings) = self.guilds_cache.get(&guild_id) {
            return Ok(settings.clone());
        }

        let path = self.guild_file_path(guild_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Guild {} sin configuración guardada, usando valores por defecto", guild_id);
            return Ok(GuildSettings {
                guild_id,
                ..self.defaults.clone()
            });
        }

        let settings = self.load_guild_settings(guild_id).await?;
        self.guilds_cache.insert(guild_id, settings.clone());
        Ok(settings)
    }

    /// Actualiza la configuración de un servidor
    pub async fn update_settings(&self, settings: GuildSettings) -> Result<()> {
        let guild_id = settings.guild_id;
        let content = serde_json::to_string_pretty(&settings)?;
        fs::write(self.guild_file_path(guild_id), content)
            .await
            .with_context(|| format!("No se pudo guardar la configuración de guild {}", guild_id))?;

        self.guilds_cache.insert(guild_id, settings);
        info!("💾 Configuración actualizada para guild {}", guild_id);
        Ok(())
    }

    /// Lista los servidores con configuración cargada
    pub fn list_guilds(&self) -> Vec<u64> {
        self.guilds_cache.iter().map(|entry| *entry.key()).collect()
    }

    async fn load_guild_settings(&self, guild_id: u64) -> Result<GuildSettings> {
        let content = fs::read_to_string(self.guild_file_path(guild_id)).await?;
        let mut settings: GuildSettings = serde_json::from_str(&content)
            .with_context(|| format!("JSON inválido para guild {}", guild_id))?;
        settings.guild_id = guild_id;
        Ok(settings)
    }

    async fn load_all_guilds(&self) -> Result<()> {
        let mut files = fs::read_dir(self.data_dir.join("guilds")).await?;
        let mut loaded_count = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let guild_id = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok());

            if let Some(guild_id) = guild_id {
                match self.load_guild_settings(guild_id).await {
                    Ok(settings) => {
                        self.guilds_cache.insert(guild_id, settings);
                        loaded_count += 1;
                    }
                    Err(e) => {
                        warn!("Error cargando configuración para guild {}: {}", guild_id, e);
                    }
                }
            }
        }

        if loaded_count > 0 {
            info!("📂 Cargadas {} configuraciones de servidor", loaded_count);
        }

        Ok(())
    }

    fn guild_file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir
            .join("guilds")
            .join(format!("guild_{}.json", guild_id))
    }
}

#[async_trait]
impl SettingsProvider for JsonStorage {
    async fn guild_settings(&self, guild_id: GuildId) -> Result<GuildSettings> {
        self.get_settings(guild_id.get()).await
    }
}
