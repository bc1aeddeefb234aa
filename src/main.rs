use clap::Parser;

use fileinfo::cli::{self, Cli, Command};
use fileinfo::config::AppConfig;
use fileinfo::logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Command::Version) = cli.command {
        cli::handle_version();
        return Ok(());
    }

    let config = AppConfig::load(cli.config.as_deref())?;
    logging::init_logging(&config.logging)?;
    for warning in &config.warnings {
        tracing::warn!("{}", warning);
    }

    match cli.command {
        None => cli::handle_serve(&config, None).await,
        Some(Command::Serve { bind }) => cli::handle_serve(&config, bind).await,
        Some(Command::Read { url, analyzers }) => cli::handle_read(&config, url, analyzers).await,
        Some(Command::Usage { start, end }) => cli::handle_usage(&config, start, end).await,
        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}
