mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, CrdAction, Commands};
use nodeguardian::config::LogConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { config, .. } => init_logging(config),
        Commands::Check { config } => init_logging(config),
        _ => init_logging_defaults(),
    }

    match cli.command {
        Commands::Run { config, secrets_dir, addr, no_leader_election } => {
            commands::run::run(&config, &secrets_dir, &addr, no_leader_election).await?;
        }
        Commands::Check { config } => {
            commands::check::run(&config).await?;
        }
        Commands::List { resource } => {
            commands::list::run(resource).await?;
        }
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
    }

    Ok(())
}

fn init_logging(config_path: &str) {
    let log = nodeguardian::config::EngineConfig::from_file(config_path)
        .map(|c| c.log)
        .unwrap_or_default();
    install_subscriber(&log);
}

fn init_logging_defaults() {
    install_subscriber(&LogConfig::default());
}

fn install_subscriber(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.format == "json" {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}
