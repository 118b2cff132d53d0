//! # Bot Module
//!
//! Discord glue around the player registry.
//!
//! [`JukeboxBot`] implements Serenity's [`EventHandler`]. It:
//!
//! - registers the slash commands on `ready` and dispatches interactions to
//!   [`handlers`];
//! - joins voice channels through Songbird and hands each guild's player a
//!   [`SongbirdSink`] on the call;
//! - watches voice state updates to auto-pause a player when its channel
//!   empties, resume it when someone comes back, and kill it when the bot is
//!   disconnected.
//!
//! A connection that fails or times out is handled like a disconnect: the
//! guild's player is killed and forgotten.

use anyhow::Result;
use dashmap::DashSet;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{
    audio::{
        player::{MusicPlayer, PlayerState},
        registry::PlayerRegistry,
        sink::SongbirdSink,
    },
    config::Config,
};

pub struct JukeboxBot {
    config: Arc<Config>,
    registry: Arc<PlayerRegistry>,
    http: reqwest::Client,
    /// Guilds paused because their voice channel emptied.
    auto_paused: DashSet<GuildId>,
}

impl JukeboxBot {
    pub fn new(config: Arc<Config>, registry: Arc<PlayerRegistry>) -> Self {
        Self {
            config,
            registry,
            http: reqwest::Client::new(),
            auto_paused: DashSet::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PlayerRegistry> {
        &self.registry
    }

    /// Joins `channel_id` and returns the guild's player, restoring its saved
    /// queue when persistence is on.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Discord context for API operations
    /// * `guild_id` - ID of the Discord server
    /// * `channel_id` - ID of the voice channel to join
    ///
    /// Gives up after `CONNECT_TIMEOUT`; a failed connection kills the
    /// guild's player.
    pub async fn summon(
        &self,
        ctx: &Context,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<MusicPlayer>> {
        let manager = songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Songbird no inicializado"))?;

        let joined = tokio::time::timeout(
            self.config.connect_timeout(),
            manager.join(guild_id, channel_id),
        )
        .await;

        let call = match joined {
            Ok(Ok(call)) => call,
            Ok(Err(e)) => {
                error!("❌ Error al conectar al canal de voz: {:?}", e);
                self.abandon(ctx, guild_id).await;
                anyhow::bail!("Error al conectar al canal de voz");
            }
            Err(_) => {
                error!("⏱️ Tiempo de conexión agotado en guild {}", guild_id);
                self.abandon(ctx, guild_id).await;
                anyhow::bail!("No se pudo conectar al canal de voz a tiempo");
            }
        };

        info!("🔊 Conectado al canal de voz en guild {}", guild_id);

        let sink = Arc::new(SongbirdSink::new(call, self.http.clone()));
        let player = self
            .registry
            .get_or_create_player(guild_id, sink, self.config.persistent_queue)
            .await?;

        if player.state() == PlayerState::Stopped {
            let player = player.clone();
            tokio::spawn(async move {
                if let Err(e) = player.start().await {
                    debug!("No se pudo iniciar la reproducción: {}", e);
                }
            });
        }

        Ok(player)
    }

    /// Leaves the voice channel, saving and killing the guild's player.
    pub async fn leave(&self, ctx: &Context, guild_id: GuildId) -> Result<()> {
        self.registry.disconnect(guild_id).await;
        self.auto_paused.remove(&guild_id);

        let manager = songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Songbird no inicializado"))?;
        if manager.get(guild_id).is_some() {
            manager.remove(guild_id).await?;
        }

        info!("👋 Desconectado del canal de voz en guild {}", guild_id);
        Ok(())
    }

    async fn abandon(&self, ctx: &Context, guild_id: GuildId) {
        if let Err(e) = self.leave(ctx, guild_id).await {
            warn!("⚠️ Error limpiando la conexión de guild {}: {:?}", guild_id, e);
        }
    }

    /// Pauses the player when nobody is listening and resumes it when
    /// someone returns. Only undoes pauses it made itself.
    fn auto_pause(&self, ctx: &Context, guild_id: GuildId) {
        let Some(player) = self.registry.player(guild_id) else {
            return;
        };
        let Some(channel_id) = bot_channel(ctx, guild_id) else {
            return;
        };

        let listeners = listeners_in(ctx, guild_id, channel_id);
        match player.state() {
            PlayerState::Playing if listeners == 0 => {
                if player.pause().is_ok() {
                    self.auto_paused.insert(guild_id);
                    info!("⏸️ Pausado automáticamente, no hay nadie escuchando en guild {}", guild_id);
                }
            }
            PlayerState::Paused if listeners > 0 && self.auto_paused.contains(&guild_id) => {
                self.auto_paused.remove(&guild_id);
                if player.resume().is_ok() {
                    info!("▶️ Reanudado automáticamente en guild {}", guild_id);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = commands::register_global_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Handles voice state updates for users and the bot.
    ///
    /// - **Bot disconnected**: the guild's player is killed
    /// - **Channel emptied / refilled**: auto-pause and resume
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };

        let current_user_id = ctx.cache.current_user().id;
        if new.user_id == current_user_id && old.is_some() && new.channel_id.is_none() {
            info!("🔌 Bot desconectado en guild {}", guild_id);
            self.registry.disconnect(guild_id).await;
            self.auto_paused.remove(&guild_id);
            return;
        }

        if self.config.auto_pause {
            self.auto_pause(&ctx, guild_id);
        }
    }
}

/// The voice channel the bot is in, from the cache.
pub fn bot_channel(ctx: &Context, guild_id: GuildId) -> Option<ChannelId> {
    let me = ctx.cache.current_user().id;
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild.voice_states.get(&me).and_then(|state| state.channel_id)
}

/// Members in `channel_id` who can hear the bot: not bots, not deafened.
/// This is the listener count skip votes are measured against.
pub fn listeners_in(ctx: &Context, guild_id: GuildId, channel_id: ChannelId) -> usize {
    let me = ctx.cache.current_user().id;
    let Some(guild) = guild_id.to_guild_cached(&ctx.cache) else {
        return 0;
    };

    guild
        .voice_states
        .values()
        .filter(|state| state.channel_id == Some(channel_id) && state.user_id != me)
        .filter(|state| !state.deaf && !state.self_deaf)
        .filter(|state| !state.member.as_ref().is_some_and(|m| m.user.bot))
        .count()
}
