//! Binary entrypoint for the meshmeter CLI.
//!
//! Commands:
//! - `start [--port <path>]` - run the agent, optionally overriding the modem serial port
//! - `init` - create a starter `config.toml`
//! - `status` - print a JSON snapshot of the effective configuration and counters
//! - `probe --port <path> [-b <baud>] [--timeout <s>]` - wait for the modem's ready banner
//!
//! See the library crate docs for module-level details: `meshmeter::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};

use meshmeter::agent::AgentServer;
use meshmeter::config::Config;
use meshmeter::mesh::NodeAddr;
use meshmeter::metrics;
use meshmeter::modem::command;

#[derive(Parser)]
#[command(name = "meshmeter")]
#[command(about = "Measurement-upload agent for mesh-networked metering nodes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the measurement agent
    Start {
        /// Modem serial port (e.g., /dev/ttyUSB0); overrides the configured one
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Initialize a new agent configuration
    Init,
    /// Show the effective configuration, derived limits and counters
    Status,
    /// Probe the modem serial link: pulse the wake line and wait for the ready banner
    Probe {
        /// Modem serial port
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short = 'b', long, default_value_t = 115200)]
        baud: u32,
        /// Seconds to wait before giving up
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config early to configure logging (except for Init which writes the default later)
    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };

    match &cli.command {
        Commands::Init => {
            // Init doesn't have config yet
        }
        _ => {
            init_logging(&pre_config, cli.verbose);
        }
    }

    match cli.command {
        Commands::Start { port } => {
            let mut config = pre_config.unwrap_or(Config::load(&cli.config).await?);
            info!("Starting Meshmeter v{}", env!("CARGO_PKG_VERSION"));

            // CLI port overrides config
            if let Some(port) = port {
                config.modem.port = port;
            }

            let (server, _handle) = AgentServer::new(config).await?;
            server.run().await?;
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            info!("Initializing new agent configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = pre_config.unwrap_or(Config::load(&cli.config).await?);
            let node_id = config
                .parse_node_id()?
                .map(|id| NodeAddr(id).to_string())
                .unwrap_or_else(|| "random".to_string());
            let payload = serde_json::json!({
                "node_id": node_id,
                "mesh_mode": config.mesh.mode,
                "mesh_port": config.mesh.port,
                "multicast_group": config.mesh.multicast_group,
                "modem_mode": config.modem.mode,
                "modem_port": config.modem.port,
                "upload_interval_secs": config.agent.upload_interval_secs,
                "block_size": config.transfer.block_size,
                "total_chunks": config.transfer.total_chunks,
                "max_cloud_payload": command::max_cloud_payload(),
                "counters": metrics::snapshot(),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Probe {
            port,
            baud,
            timeout,
        } => {
            #[cfg(not(feature = "serial"))]
            {
                let _ = (port, baud, timeout);
                eprintln!("Error: probe requires the 'serial' feature.");
                eprintln!("Compile with: cargo build --features serial");
                std::process::exit(2);
            }
            #[cfg(feature = "serial")]
            {
                use meshmeter::modem::CommandPort as _;
                use tokio::time::{timeout as recv_timeout, Duration, Instant};

                info!("Probing modem on {} @ {} baud", port, baud);
                let (mut dev, mut lines) = meshmeter::modem::serial::open(&port, baud).await?;
                dev.wake();
                let deadline = Instant::now() + Duration::from_secs(timeout);
                let mut synced = false;
                let mut lines_seen = 0u32;
                while Instant::now() < deadline {
                    let remaining = deadline - Instant::now();
                    match recv_timeout(remaining, lines.recv()).await {
                        Ok(Some(line)) => {
                            lines_seen += 1;
                            if matches!(command::parse_line(&line), command::ModemEvent::Sync) {
                                synced = true;
                                break;
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                if !synced {
                    warn!(
                        "No ready banner within {}s ({} line(s) seen)",
                        timeout, lines_seen
                    );
                }
                let payload = serde_json::json!({
                    "status": if synced { "ok" } else { "no-sync" },
                    "synced": synced,
                    "lines_seen": lines_seen,
                    "timeout_seconds": timeout,
                });
                println!("{}", payload);
                std::process::exit(if synced { 0 } else { 1 });
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|cfg| cfg.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    if let Some(file) = config.as_ref().and_then(|cfg| cfg.logging.file.clone()) {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
        {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));

            // If stdout is a terminal, mirror the file lines to the console.
            let is_tty = atty::is(atty::Stream::Stdout);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());

                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }

                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        } else {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
