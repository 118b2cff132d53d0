use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::SerenityInit;
use std::{sync::Arc, time::Duration};
use tracing::{error, info};

use guild_jukebox::{
    audio::{autoplaylist::AutoPlaylist, registry::PlayerRegistry},
    bot::JukeboxBot,
    cache::CachedResolver,
    config::Config,
    sources::YtDlpResolver,
    storage::QueueStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_jukebox=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Guild Jukebox v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    // Autoplaylist compartida por todos los servidores
    let autoplaylist = Arc::new(
        AutoPlaylist::load(
            &config.auto_playlist_file,
            config.autoplaylist_removed_file(),
            config.remove_from_ap_on_error,
        )
        .await?,
    );

    // Resolver con caché de metadatos
    let resolver = Arc::new(CachedResolver::new(YtDlpResolver::new(
        config.ytdlp_path.clone(),
        config.audio_cache_dir.clone(),
    )));

    let maintenance = resolver.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600)); // Cada hora
        loop {
            interval.tick().await;
            maintenance.cleanup_old_entries();
        }
    });

    let store = Arc::new(QueueStore::new(config.data_dir.clone()));
    if config.persistent_queue {
        let saved = store.saved_guilds().await;
        info!("📂 {} servidores con cola guardada", saved.len());
    }
    let registry = Arc::new(PlayerRegistry::new(&config, resolver, autoplaylist, store));

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = JukeboxBot::new(Arc::new(config.clone()), registry.clone());

    // Construir cliente
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird()
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, guardando colas...");
        registry.serialize_all().await;
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    // Verificar dependencias críticas
    let version = YtDlpResolver::new(config.ytdlp_path.clone(), config.audio_cache_dir.clone())
        .version()
        .await?;

    println!("OK (yt-dlp {})", version);
    Ok(())
}
