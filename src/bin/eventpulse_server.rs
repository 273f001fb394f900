//! EventPulse realtime server
//!
//! Listens for storage-layer change notifications and fans them out to
//! WebSocket observers.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use eventpulse::server::gateway::ObserverGateway;
use eventpulse::server::listener::{ChangeListener, PgChangeFeed};
use eventpulse::{Broadcaster, ServerConfig, SubscriptionRegistry};

fn usage() {
    println!("eventpulse-server - change notification fan-out");
    println!();
    println!("USAGE:");
    println!("    eventpulse-server [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -b, --bind <ADDR>          Address to listen on [default: 127.0.0.1:8081]");
    println!("    -d, --database-url <URL>   Change feed connection string [env: DATABASE_URL]");
    println!("    -c, --channel <NAME>       Notification channel [default: table_changes]");
    println!("        --require-realtime     Exit if the change feed is unreachable at startup");
    println!("    -h, --help                 Print help information");
    println!();
    println!("Other settings are read from EVENTPULSE_* environment variables.");
}

fn value_of(args: &[String], i: usize, flag: &str) -> String {
    if let Some(value) = args.get(i + 1) {
        value.clone()
    } else {
        eprintln!("error: {flag} requires a value");
        std::process::exit(1);
    }
}

/// Applies command-line flags on top of the environment.
fn parse_args(mut config: ServerConfig) -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                let raw = value_of(&args, i, "--bind");
                config.bind_addr = raw.parse::<SocketAddr>().unwrap_or_else(|_| {
                    eprintln!("error: invalid bind address: {raw}");
                    std::process::exit(1);
                });
                i += 2;
            }
            "--database-url" | "-d" => {
                config.database_url = value_of(&args, i, "--database-url");
                i += 2;
            }
            "--channel" | "-c" => {
                config.channel = value_of(&args, i, "--channel");
                i += 2;
            }
            "--require-realtime" => {
                config.require_realtime = true;
                i += 1;
            }
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = parse_args(ServerConfig::from_env()?);
    config.validate()?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting eventpulse-server");

    let registry = Arc::new(SubscriptionRegistry::new());
    let broadcaster = Arc::new(Broadcaster::new(registry));

    let listener = ChangeListener::new(
        Arc::new(PgChangeFeed::new(config.database_url.clone())),
        Arc::clone(&broadcaster),
        config.channel.clone(),
        config.reconnect,
    );
    let listener_handle = match listener.clone().start().await {
        Ok(handle) => handle,
        Err(e) if config.require_realtime => {
            error!(error = %e, "change feed unavailable and realtime is required");
            return Err(e.into());
        }
        Err(e) => {
            warn!(error = %e, "starting without realtime; retrying the change feed in the background");
            listener.spawn()
        }
    };

    let gateway = ObserverGateway::bind(&config, &broadcaster).await?;
    info!(addr = %gateway.local_addr()?, "press Ctrl+C to stop");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(gateway.serve(shutdown_rx));

    let _ = signal::ctrl_c().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    listener_handle.shutdown().await;
    server.await??;

    let stats = broadcaster.stats();
    info!(
        dispatched = stats.dispatched,
        delivered = stats.delivered,
        evicted = stats.evicted,
        "shut down"
    );
    Ok(())
}
