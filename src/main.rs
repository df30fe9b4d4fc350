use anyhow::Result;
use serenity::{http::Http, model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info};

use open_music_engine::{
    audio::{limiter::ErrorLimiter, AudioManager, ManagerOptions},
    bot::{events, OpenMusicBot, SongbirdGateway},
    cache::SearchCache,
    config::Config,
    node::NodePool,
    sources::NodeSearch,
    storage::{GuildSettings, JsonStorage},
};

const MAINTENANCE_EVERY: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_engine=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    // Los nodos necesitan el id del bot para el handshake
    let user_id = Http::new(&config.discord_token).get_current_user().await?.id;

    // Nodos de audio
    let (node_tx, node_rx) = mpsc::unbounded_channel();
    let pool = Arc::new(NodePool::new(
        user_id,
        config.shard_count,
        config.reconnect_policy(),
        node_tx,
    ));
    for node in &config.nodes {
        pool.add_node(node.clone());
    }

    // Búsqueda con caché
    let search = Arc::new(NodeSearch::new(
        Arc::clone(&pool),
        SearchCache::for_search(
            config.search_cache_size,
            Duration::from_secs(config.search_cache_ttl_secs),
        ),
    ));

    // Configuración por servidor
    let defaults = GuildSettings {
        volume_fraction: config.default_volume,
        autoplay: config.enable_autoplay,
        ..GuildSettings::default()
    };
    let storage = Arc::new(JsonStorage::new(config.data_dir.clone(), defaults).await?);

    // Construir cliente
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
    let songbird = Songbird::serenity();
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(OpenMusicBot::new(Arc::clone(&search), MAINTENANCE_EVERY))
        .register_songbird_with(Arc::clone(&songbird))
        .await?;

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let manager = Arc::new(AudioManager::new(
        user_id,
        pool,
        Arc::new(SongbirdGateway::new(songbird, Arc::clone(&client.cache))),
        search,
        storage,
        Arc::new(ErrorLimiter::new(
            config.error_ceiling,
            Duration::from_secs(config.error_window_secs),
        )),
        signal_tx,
        ManagerOptions {
            inactivity_interval: Duration::from_secs(config.inactivity_interval_secs),
            recommendation_filter: config.recommendation_filter,
        },
    ));

    // Insertar el manager en el contexto del cliente
    {
        let mut data = client.data.write().await;
        data.insert::<AudioManager>(Arc::clone(&manager));
    }

    manager.spawn_dispatcher(node_rx);
    events::spawn_signal_loop(Arc::clone(&manager), signal_rx);

    // Manejar shutdown graceful
    let shard_manager = Arc::clone(&client.shard_manager);
    let shutdown_manager = Arc::clone(&manager);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        shutdown_manager.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    let started = if config.shard_count > 1 {
        client.start_shards(config.shard_count).await
    } else {
        client.start().await
    };
    if let Err(why) = started {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}
