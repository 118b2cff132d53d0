use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::application::CommandOptionType,
    prelude::Context,
};

/// Registra comandos globales
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }

    Ok(())
}

fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        stream_command(),
        skip_command(),
        pause_command(),
        resume_command(),
        stop_command(),
        queue_command(),
        remove_command(),
        move_command(),
        shuffle_command(),
        clear_command(),
        volume_command(),
        karaoke_command(),
        autoplaylist_command(),
        join_command(),
        leave_command(),
    ]
}

// Comandos de cola

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Reproduce una canción o playlist")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "query",
                "URL o término de búsqueda",
            )
            .required(true),
        )
}

fn stream_command() -> CreateCommand {
    CreateCommand::new("stream")
        .description("Reproduce una transmisión en vivo")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "url", "URL de la transmisión")
                .required(true),
        )
}

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue").description("Muestra la cola de reproducción")
}

fn remove_command() -> CreateCommand {
    CreateCommand::new("remove")
        .description("Quita canciones de la cola")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "position", "Posición en la cola")
                .min_int_value(1),
        )
        .add_option(CreateCommandOption::new(
            CommandOptionType::User,
            "user",
            "Quita todas las canciones de este usuario",
        ))
}

fn move_command() -> CreateCommand {
    CreateCommand::new("move")
        .description("Mueve una canción a otra posición")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "from", "Posición actual")
                .min_int_value(1)
                .required(true),
        )
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "to", "Nueva posición")
                .min_int_value(1)
                .required(true),
        )
}

fn shuffle_command() -> CreateCommand {
    CreateCommand::new("shuffle").description("Mezcla la cola")
}

fn clear_command() -> CreateCommand {
    CreateCommand::new("clear").description("Limpia la cola")
}

// Comandos de control

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip")
        .description("Vota para saltar la canción actual")
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "force",
            "Salta sin votación (requiere permisos)",
        ))
}

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pausa la reproducción actual")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Reanuda la reproducción pausada")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Detiene la reproducción sin borrar la cola")
}

fn volume_command() -> CreateCommand {
    CreateCommand::new("volume")
        .description("Ajusta el volumen")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "level", "Volumen (0-100)")
                .min_int_value(0)
                .max_int_value(100),
        )
}

fn karaoke_command() -> CreateCommand {
    CreateCommand::new("karaoke")
        .description("Solo usuarios con permisos pueden encolar canciones")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Boolean, "enabled", "Activar o desactivar")
                .required(true),
        )
}

fn autoplaylist_command() -> CreateCommand {
    CreateCommand::new("autoplaylist")
        .description("Administra la autoplaylist")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "action", "Acción")
                .add_string_choice("Guardar la canción actual", "save")
                .add_string_choice("Reactivar", "reset")
                .required(true),
        )
}

// Comandos de conexión

fn join_command() -> CreateCommand {
    CreateCommand::new("join").description("Conecta el bot a tu canal de voz")
}

fn leave_command() -> CreateCommand {
    CreateCommand::new("leave").description("Desconecta el bot del canal de voz")
}
