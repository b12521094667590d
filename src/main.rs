use clap::Parser;
use color_eyre::Result;
use serial_relay::{cli, config::Config, logging, server, session::SessionHandle};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Some(command) = cli.command {
        cli::handle_command(command)?;

        return Ok(());
    }

    logging::init(
        cli.log_level,
        cli.log_dir.map(|directory| (cli.log_level, directory)),
    )
    .await;

    let config = if let Some(config_path) = cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)?
    } else {
        debug!("Default config");
        Config::default()
    };
    config.validate()?;

    let session = SessionHandle::from_config(&config);

    #[cfg(unix)]
    let mut hangup = signal(SignalKind::hangup())?;

    #[cfg(unix)]
    let hung_up = hangup.recv();

    #[cfg(not(unix))]
    let hung_up = std::future::pending::<Option<()>>();

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting");
            Ok(())
        }
        _ = hung_up => {
            info!("Told to hang up, quitting");
            Ok(())
        }
        result = server::serve(config, session.clone(), Some(cli.port), None) => {
            error!(?result, "Server returned");
            Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"))
        }
    };

    session.shutdown().await;
    logging::shutdown();

    outcome
}
