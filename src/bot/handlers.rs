use anyhow::Result;
use serenity::{
    builder::{CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse},
    model::{
        application::{CommandDataOptionValue, CommandInteraction},
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::{
    audio::{
        entry::DownloadState,
        player::{MusicPlayer, SkipOutcome, SkipRequest},
        registry::{Queued, SongRequest, UserLimits},
    },
    bot::{bot_channel, listeners_in, JukeboxBot},
    config::Config,
    error::PlayerError,
};

/// Canciones mostradas por /queue
const QUEUE_PAGE: usize = 10;

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &JukeboxBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    // Estos pueden tardar: conexión de voz y resolución de metadatos
    if matches!(command.data.name.as_str(), "play" | "stream" | "join") {
        command
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
            )
            .await?;

        let message = match command.data.name.as_str() {
            "play" => handle_play(ctx, &command, bot, guild_id).await,
            "stream" => handle_stream(ctx, &command, bot, guild_id).await,
            _ => handle_join(ctx, &command, bot, guild_id).await,
        }
        .unwrap_or_else(|e| format!("❌ {}", e));

        command
            .edit_response(&ctx.http, EditInteractionResponse::new().content(message))
            .await?;
        return Ok(());
    }

    let message = match command.data.name.as_str() {
        "skip" => handle_skip(ctx, &command, bot, guild_id),
        "pause" => require_player(bot, guild_id)
            .and_then(|p| Ok(p.pause()?))
            .map(|_| "⏸️ Reproducción pausada".to_string()),
        "resume" => require_player(bot, guild_id)
            .and_then(|p| Ok(p.resume()?))
            .map(|_| "▶️ Reproducción reanudada".to_string()),
        "stop" => require_player(bot, guild_id)
            .and_then(|p| Ok(p.stop()?))
            .map(|_| "⏹️ Reproducción detenida".to_string()),
        "queue" => require_player(bot, guild_id).map(|p| queue_listing(&p)),
        "remove" => handle_remove(&command, bot, guild_id),
        "move" => handle_move(&command, bot, guild_id),
        "shuffle" => require_player(bot, guild_id).map(|p| {
            p.playlist().shuffle();
            "🔀 Cola mezclada".to_string()
        }),
        "clear" => require_player(bot, guild_id).map(|p| {
            let removed = p.playlist().clear();
            format!("🗑️ Cola limpiada ({} canciones)", removed)
        }),
        "volume" => handle_volume(&command, bot, guild_id),
        "karaoke" => handle_karaoke(&command, bot, guild_id),
        "autoplaylist" => handle_autoplaylist(&command, bot, guild_id).await,
        "leave" => bot
            .leave(ctx, guild_id)
            .await
            .map(|_| "👋 Desconectado del canal de voz".to_string()),
        _ => Ok("❌ Comando no reconocido".to_string()),
    }
    .unwrap_or_else(|e| format!("❌ {}", e));

    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().content(message),
            ),
        )
        .await?;

    Ok(())
}

// Handlers específicos para cada comando

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<String> {
    let query = option(command, "query")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?;

    let player = connected_player(ctx, command, bot, guild_id).await?;
    let request = song_request(command, bot, guild_id, query);

    let message = match bot.registry().queue_song(request).await? {
        Queued::Single { entry, position } => {
            let eta = player.playlist().estimate_time_until(position, &player);
            let mut message = format!("➕ Agregado a la cola: **{}** (posición {})", entry.title(), position);
            if !eta.is_zero() {
                message.push_str(&format!(", suena en ~{}", fmt_duration(eta)));
            }
            message
        }
        Queued::Imported { entries, start } => format!(
            "📃 {} canciones agregadas desde la posición {}",
            entries.len(),
            start
        ),
    };

    Ok(message)
}

async fn handle_stream(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<String> {
    let url = option(command, "url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("URL no proporcionada"))?;

    connected_player(ctx, command, bot, guild_id).await?;
    let request = song_request(command, bot, guild_id, url);
    let entry = bot.registry().queue_stream(request).await?;

    Ok(format!("📡 Stream agregado a la cola: **{}**", entry.title()))
}

async fn handle_join(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<String> {
    let channel_id = get_user_voice_channel(ctx, guild_id, command.user.id)?;
    bot.summon(ctx, guild_id, channel_id).await?;
    Ok("🔊 Conectado al canal de voz".to_string())
}

fn handle_skip(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<String> {
    let force = option(command, "force")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let is_author = bot
        .registry()
        .player(guild_id)
        .and_then(|player| player.current_entry())
        .is_some_and(|entry| entry.requester() == Some(command.user.id));

    let request = if wants_force_skip(bot.config(), force, is_dj(command), is_author)? {
        SkipRequest::Force
    } else {
        let listeners = bot_channel(ctx, guild_id).map_or(1, |c| listeners_in(ctx, guild_id, c));
        SkipRequest::Vote {
            voter: command.user.id,
            message: None,
            listeners,
        }
    };

    let message = match bot.registry().skip(guild_id, request)? {
        SkipOutcome::Skipped { entry } => format!("⏭️ Saltando: **{}**", entry.title()),
        SkipOutcome::Voted { votes, required } => {
            format!("🗳️ Voto registrado: {}/{} para saltar", votes, required)
        }
        SkipOutcome::Idle => "📭 No hay nada reproduciéndose".to_string(),
    };
    Ok(message)
}

fn handle_remove(command: &CommandInteraction, bot: &JukeboxBot, guild_id: GuildId) -> Result<String> {
    let player = require_player(bot, guild_id)?;
    let playlist = player.playlist();

    if let Some(user) = option(command, "user").and_then(|v| v.as_user_id()) {
        if user != command.user.id && !is_dj(command) {
            return Err(PlayerError::PermissionDenied(
                "solo puedes quitar tus propias canciones".to_string(),
            )
            .into());
        }
        let removed = playlist.remove_all_by(user);
        return Ok(format!("🗑️ {} canciones quitadas", removed.len()));
    }

    let position = option(command, "position")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| anyhow::anyhow!("Indica una posición o un usuario"))?;
    let position = usize::try_from(position).unwrap_or(0);

    let entries = playlist.entries();
    if let Some(entry) = position.checked_sub(1).and_then(|index| entries.get(index)) {
        if entry.requester() != Some(command.user.id) && !is_dj(command) {
            return Err(PlayerError::PermissionDenied(
                "solo puedes quitar tus propias canciones".to_string(),
            )
            .into());
        }
    }

    let entry = playlist.remove_position(position)?;
    Ok(format!("🗑️ Quitada de la cola: **{}**", entry.title()))
}

fn handle_move(command: &CommandInteraction, bot: &JukeboxBot, guild_id: GuildId) -> Result<String> {
    let player = require_player(bot, guild_id)?;
    let position = |name| {
        option(command, name)
            .and_then(|v| v.as_i64())
            .and_then(|p| usize::try_from(p).ok())
            .filter(|p| *p > 0)
            .ok_or_else(|| anyhow::anyhow!("Posición inválida"))
    };
    let (from, to) = (position("from")?, position("to")?);

    let entry = player.playlist().move_entry(from - 1, to - 1)?;
    Ok(format!("↕️ **{}** movida a la posición {}", entry.title(), to))
}

fn handle_volume(command: &CommandInteraction, bot: &JukeboxBot, guild_id: GuildId) -> Result<String> {
    let player = require_player(bot, guild_id)?;

    let message = match option(command, "level").and_then(|v| v.as_i64()) {
        Some(level) => {
            let applied = player.set_volume(level as f32 / 100.0);
            format!("🔊 Volumen ajustado a {}%", (applied * 100.0).round() as u32)
        }
        None => format!("🔊 Volumen actual: {}%", (player.volume() * 100.0).round() as u32),
    };
    Ok(message)
}

fn handle_karaoke(command: &CommandInteraction, bot: &JukeboxBot, guild_id: GuildId) -> Result<String> {
    if !is_dj(command) {
        return Err(PlayerError::PermissionDenied(
            "necesitas permisos para cambiar el modo karaoke".to_string(),
        )
        .into());
    }

    let player = require_player(bot, guild_id)?;
    let enabled = option(command, "enabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    player.set_karaoke_mode(enabled);

    Ok(if enabled {
        "🎤 Modo karaoke activado".to_string()
    } else {
        "🎤 Modo karaoke desactivado".to_string()
    })
}

async fn handle_autoplaylist(
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<String> {
    let player = require_player(bot, guild_id)?;

    match option(command, "action").and_then(|v| v.as_str()) {
        Some("save") => {
            let entry = player
                .current_entry()
                .ok_or_else(|| anyhow::anyhow!("No hay nada reproduciéndose"))?;
            if bot.registry().save_to_autoplaylist(entry.url()).await? {
                Ok(format!("📻 **{}** agregada a la autoplaylist", entry.title()))
            } else {
                Ok("📻 Esa canción ya está en la autoplaylist".to_string())
            }
        }
        Some("reset") => {
            player.reset_autoplaylist();
            Ok("🔄 Autoplaylist reactivada".to_string())
        }
        _ => Err(anyhow::anyhow!("Acción desconocida")),
    }
}

/// Renders the current entry and the head of the queue with wait times.
pub fn queue_listing(player: &MusicPlayer) -> String {
    let mut lines = Vec::new();

    if let Some(current) = player.current_entry() {
        let progress = fmt_duration(player.progress());
        let total = current.duration().map_or("en vivo".to_string(), fmt_duration);
        lines.push(format!("🎵 Sonando: **{}** [{}/{}]", current.title(), progress, total));
    }

    let entries = player.playlist().entries();
    if entries.is_empty() {
        lines.push("📭 La cola está vacía".to_string());
        return lines.join("\n");
    }

    for (index, entry) in entries.iter().take(QUEUE_PAGE).enumerate() {
        let position = index + 1;
        let requester = entry
            .requester()
            .map_or(String::new(), |user| format!(" - <@{}>", user));
        let eta = player.playlist().estimate_time_until(position, player);
        let download = match entry.state() {
            DownloadState::Downloading { progress: Some(p) } => format!(" ⬇️ {}%", (p * 100.0).round() as u8),
            DownloadState::Downloading { progress: None } => " ⬇️".to_string(),
            _ => String::new(),
        };
        lines.push(format!(
            "`{}.` **{}**{} (en ~{}){}",
            position,
            entry.title(),
            requester,
            fmt_duration(eta),
            download
        ));
    }

    if entries.len() > QUEUE_PAGE {
        lines.push(format!("... y {} más", entries.len() - QUEUE_PAGE));
    }

    lines.join("\n")
}

// Funciones auxiliares

fn option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a CommandDataOptionValue> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .map(|opt| &opt.value)
}

/// Usuarios con "Gestionar canales" saltan sin votar y omiten el karaoke
/// `true` si el salto no pasa por votación
fn wants_force_skip(config: &Config, force: bool, is_dj: bool, is_author: bool) -> Result<bool, PlayerError> {
    if !force && !config.legacy_skip {
        return Ok(false);
    }
    if is_dj || (config.allow_author_skip && is_author) {
        return Ok(true);
    }
    Err(PlayerError::PermissionDenied(
        "necesitas permisos para saltar sin votación".to_string(),
    ))
}

fn is_dj(command: &CommandInteraction) -> bool {
    command
        .member
        .as_ref()
        .and_then(|member| member.permissions)
        .is_some_and(|permissions| permissions.manage_channels())
}

fn song_request(command: &CommandInteraction, bot: &JukeboxBot, guild_id: GuildId, spec: &str) -> SongRequest {
    SongRequest {
        guild_id,
        user: command.user.id,
        channel: Some(command.channel_id),
        spec: spec.to_string(),
        limits: UserLimits {
            bypass_karaoke: is_dj(command),
            ..UserLimits::from_config(bot.config())
        },
    }
}

fn require_player(bot: &JukeboxBot, guild_id: GuildId) -> Result<Arc<MusicPlayer>> {
    bot.registry()
        .player(guild_id)
        .ok_or_else(|| anyhow::anyhow!("El bot no está en un canal de voz"))
}

async fn connected_player(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<Arc<MusicPlayer>> {
    if let Some(player) = bot.registry().player(guild_id) {
        return Ok(player);
    }
    let channel_id = get_user_voice_channel(ctx, guild_id, command.user.id)?;
    bot.summon(ctx, guild_id, channel_id).await
}

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Result<ChannelId> {
    let guild = guild_id
        .to_guild_cached(&ctx.cache)
        .ok_or_else(|| anyhow::anyhow!("Guild no encontrada en caché"))?;

    let channel_id = guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or_else(|| anyhow::anyhow!("Debes estar en un canal de voz"))?;

    Ok(channel_id)
}

fn fmt_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else {
        format!("{}:{:02}", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{entry::EntryOrigin, player::PlayerSettings},
        testing::{origin_for, player_with, FakeSink, ScriptedResolver},
    };

    #[test]
    fn test_fmt_duration() {
        assert_eq!(fmt_duration(Duration::from_secs(59)), "0:59");
        assert_eq!(fmt_duration(Duration::from_secs(185)), "3:05");
        assert_eq!(fmt_duration(Duration::from_secs(3723)), "1:02:03");
    }

    #[tokio::test]
    async fn test_queue_listing_shows_positions_and_requesters() {
        let settings = PlayerSettings {
            autoplaylist: false,
            ..PlayerSettings::default()
        };
        let sink = FakeSink::new();
        let player = player_with(ScriptedResolver::new(), sink.clone(), &[], settings);

        player.playlist().add_entry("first", EntryOrigin::system()).await.unwrap();
        sink.wait_for_plays(1).await;
        player.playlist().add_entry("second", origin_for(7)).await.unwrap();

        let listing = queue_listing(&player);
        assert!(listing.contains("Sonando: **first**"));
        assert!(listing.contains("`1.` **second** - <@7>"));
    }

    #[test]
    fn test_force_skip_permissions() {
        let config = Config::default();
        // Votación normal
        assert_eq!(wants_force_skip(&config, false, false, false), Ok(false));
        assert_eq!(wants_force_skip(&config, false, true, true), Ok(false));
        // DJ o autor de la canción
        assert_eq!(wants_force_skip(&config, true, true, false), Ok(true));
        assert_eq!(wants_force_skip(&config, true, false, true), Ok(true));
        assert!(matches!(
            wants_force_skip(&config, true, false, false),
            Err(PlayerError::PermissionDenied(_))
        ));

        let strict = Config {
            allow_author_skip: false,
            ..Config::default()
        };
        assert!(wants_force_skip(&strict, true, false, true).is_err());
    }

    #[test]
    fn test_legacy_skip_forces_every_skip() {
        let config = Config {
            legacy_skip: true,
            ..Config::default()
        };
        assert_eq!(wants_force_skip(&config, false, false, true), Ok(true));
        assert_eq!(wants_force_skip(&config, false, true, false), Ok(true));
        assert!(wants_force_skip(&config, false, false, false).is_err());
    }

    #[test]
    fn test_empty_queue_listing() {
        let player = player_with(ScriptedResolver::new(), FakeSink::new(), &[], PlayerSettings::default());
        assert_eq!(queue_listing(&player), "📭 La cola está vacía");
    }
}
