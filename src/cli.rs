use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;

use crate::{actions, config::Config, error::Error, serial::serial_port};

/// The command line interface for serial relay.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Which port the server listens on.
    #[arg(short, long, default_value_t = crate::server::DEFAULT_PORT)]
    pub port: u16,

    /// Log level for stdout.
    /// Ignored if RUST_LOG is set.
    #[arg(short, long, default_value_t = Level::INFO)]
    pub log_level: Level,

    /// If given, also log to daily rotated files in this directory.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),

    /// List the serial ports on this machine.
    Ports,
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example JSON request connecting to a port.
    Connect,

    /// Show an example JSON request writing a raw payload to the device.
    SendRaw,

    /// Show an example JSON message (from server to client) carrying a record.
    Record,

    /// Show an example JSON reply to a command which failed.
    Error,
}

/// Run a subcommand, printing its output.
pub fn handle_command(command: Commands) -> Result<(), Error> {
    let output = match command {
        Commands::Examples(example) => match example {
            Examples::Config => Config::example().serialize_pretty()?,
            Examples::Connect => actions::example_connect().serialize()?,
            Examples::SendRaw => actions::example_send_raw().serialize()?,
            Examples::Record => actions::example_record()?.serialize()?,
            Examples::Error => actions::example_error().serialize()?,
        },
        Commands::Ports => {
            let ports = serial_port::available_ports()?;
            if ports.is_empty() {
                "No serial ports found".to_owned()
            } else {
                ports.join("\n")
            }
        }
    };

    println!("{output}");

    Ok(())
}
