use clap::Parser;
use color_eyre::Result;
use serial_relay::client::ClientHandle;
use tracing::{error, info, Level};

/// Mocks a client for testing purposes.
///
/// Connects the server to a loopback port and starts acquisition.
/// Then sends fake readings at the given rate, which come back as records.
#[derive(Parser, Debug)]
struct Args {
    /// Server address.
    #[arg(short, long, default_value = "localhost")]
    address: String,

    /// Server port.
    #[arg(short, long, default_value_t = serial_relay::server::DEFAULT_PORT)]
    port: u16,

    /// The loopback port to connect to.
    /// Must be listed under `loopback_ports` in the server configuration.
    #[arg(short, long, default_value = "COM_MOCK")]
    device: String,

    /// Baud rate to connect with.
    #[arg(short, long, default_value_t = 9600)]
    baudrate: u32,

    /// How long to wait before a new reading is sent.
    /// In milliseconds.
    #[arg(short, long, default_value = "500")]
    send_interval_ms: u64,
}

async fn run(args: Args) -> Result<()> {
    let mut client = ClientHandle::new(&args.address, args.port).await?;

    info!(reply = %client.connect(&args.device, args.baudrate).await?, "Connect");
    info!(reply = %client.start().await?, "Start");

    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(args.send_interval_ms));

    for tick in 0u64.. {
        interval.tick().await;

        let voltage = 3.0 + (tick % 10) as f64 * 0.05;
        let reading = format!(r#"{{"voltage": {voltage:.2}, "tick": {tick}}}"#);
        client.send_raw(&reading).await?;

        let record = client.next_record().await?;
        info!(timestamp = record.timestamp(), payload = ?record.payload(), "Record");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    serial_relay::logging::init(Level::INFO, None).await;

    let args = Args::parse();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        result = run(args) => {
            error!(?result, "Client returned")
        }
    }

    Ok(())
}
