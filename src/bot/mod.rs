//! # Bot Module
//!
//! Discord side of Open Music.
//!
//! This module contains:
//! - The serenity [`EventHandler`] that feeds voice gateway events to the
//!   [`AudioManager`]
//! - [`SongbirdGateway`], the [`VoiceGateway`] used by players to join and
//!   leave voice channels
//! - Background maintenance (error counters, search cache and idle event mailboxes)
//! - The [`events`] loop that reacts to player signals
//!
//! The manager is stored in serenity's `TypeMap`, so handlers fetch it from
//! the context instead of owning it.

use anyhow::Result;
use async_trait::async_trait;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Ready, VoiceServerUpdateEvent, VoiceState},
    cache::Cache,
};
use songbird::{error::JoinError, Songbird};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

pub mod events;

use crate::{
    audio::{player::VoiceGateway, AudioManager},
    sources::NodeSearch,
};

/// Handler de eventos de Discord
pub struct OpenMusicBot {
    search: Arc<NodeSearch>,
    maintenance_every: Duration,
    maintenance_started: AtomicBool,
}

impl OpenMusicBot {
    pub fn new(search: Arc<NodeSearch>, maintenance_every: Duration) -> Self {
        Self {
            search,
            maintenance_every,
            maintenance_started: AtomicBool::new(false),
        }
    }
}

async fn audio_manager(ctx: &Context) -> Option<Arc<AudioManager>> {
    let manager = ctx.data.read().await.get::<AudioManager>().cloned();
    if manager.is_none() {
        warn!("⚠️ Audio manager no registrado todavía");
    }
    manager
}

#[async_trait]
impl EventHandler for OpenMusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        // `ready` se repite en cada reconexión del gateway
        if self.maintenance_started.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(manager) = audio_manager(&ctx).await {
            tokio::spawn(maintenance_tasks(
                manager,
                Arc::clone(&self.search),
                self.maintenance_every,
            ));
        }
    }

    async fn voice_state_update(&self, ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        let Some(manager) = audio_manager(&ctx).await else {
            return;
        };

        manager
            .handle_voice_state(guild_id, new.user_id, new.channel_id, &new.session_id)
            .await;
    }

    async fn voice_server_update(&self, ctx: Context, event: VoiceServerUpdateEvent) {
        let Some(guild_id) = event.guild_id else {
            debug!("VOICE_SERVER_UPDATE sin guild ignorado");
            return;
        };
        let Some(manager) = audio_manager(&ctx).await else {
            return;
        };

        manager
            .handle_voice_server(guild_id, &event.token, event.endpoint)
            .await;
    }
}

/// Presencia de voz vía songbird (sólo gateway; el audio lo envía el nodo)
pub struct SongbirdGateway {
    songbird: Arc<Songbird>,
    cache: Arc<Cache>,
}

impl SongbirdGateway {
    pub fn new(songbird: Arc<Songbird>, cache: Arc<Cache>) -> Self {
        Self { songbird, cache }
    }
}

#[async_trait]
impl VoiceGateway for SongbirdGateway {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<()> {
        let call = self.songbird.get_or_insert(guild_id);
        // La conexión se confirma con los eventos de voz que recibe el manager
        let _pending = call.lock().await.join_gateway(channel_id).await?;

        info!("🔊 Uniéndose al canal {} en guild {}", channel_id, guild_id);
        Ok(())
    }

    async fn leave(&self, guild_id: GuildId) -> Result<()> {
        match self.songbird.remove(guild_id).await {
            Ok(()) | Err(JoinError::NoCall) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn listeners(&self, guild_id: GuildId, channel_id: ChannelId) -> Option<usize> {
        let guild = self.cache.guild(guild_id)?;
        let count = guild
            .voice_states
            .values()
            .filter(|state| state.channel_id == Some(channel_id))
            .filter(|state| !state.member.as_ref().is_some_and(|member| member.user.bot))
            .count();
        Some(count)
    }
}

/// Tareas de mantenimiento periódicas
async fn maintenance_tasks(manager: Arc<AudioManager>, search: Arc<NodeSearch>, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;

        let counters = manager.limiter().cleanup_expired();
        search.cache().cleanup_old_entries();
        manager.prune_mailboxes();

        let metrics = search.cache().metrics();
        debug!(
            "📈 Cache de búsqueda: {} entradas, {:.0}% aciertos",
            search.cache().len(),
            metrics.hit_rate() * 100.0
        );

        info!(
            "🧹 Tareas de mantenimiento completadas ({} contadores de error vencidos, {} players)",
            counters,
            manager.player_count()
        );
    }
}
