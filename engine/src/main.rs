// Bastion plugin security toolkit
// Main entry point for the bastion binary

use bastion_engine::cli::{Cli, Command, ConfigAction};
use bastion_engine::config::Config;
use bastion_engine::handlers::{
    handle_config_path, handle_config_show, handle_digest, handle_permissions, handle_presets,
    handle_validate, OutputFormat,
};
use bastion_engine::telemetry::init_telemetry_with_level;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config file; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    tracing::debug!("Bastion v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Validate { file } => handle_validate(&file, format),
        Command::Digest { file } => handle_digest(&file, format),
        Command::Permissions => handle_permissions(format),
        Command::Presets => handle_presets(format),
        Command::Config { action } => match action {
            ConfigAction::Show => handle_config_show(&config, format),
            ConfigAction::Path => {
                let path = match &cli.config {
                    Some(path) => path.clone(),
                    None => Config::default_config_path()?,
                };
                handle_config_path(&path, format)
            }
        },
    }
}
