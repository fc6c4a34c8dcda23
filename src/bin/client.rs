//! UDP TLS Pool Client
//!
//! Listens for UDP datagrams and carries each peer's traffic to the server
//! over a pool of persistent TLS streams.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use udp_tls_pool::{
    client::UdpListener,
    config::{generate_example_config, ClientConfig, Config},
    logging::init_logging,
    transport::{build_client_config, Connector, TcpConnector, TlsConnector},
    tunnel::SessionFactory,
    VERSION,
};

/// UDP TLS Pool Client - UDP over pooled TLS streams
#[derive(Parser, Debug)]
#[command(name = "pool-client")]
#[command(about = "UDP TLS Pool Client - carries UDP datagrams over pooled TLS streams")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Local UDP listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        print!("{}", generate_example_config().to_toml()?);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    init_logging(&config.logging, args.log_level.as_deref())?;

    let mut client_config = config
        .client
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    if let Some(listen) = args.listen {
        client_config.listen = listen;
    }
    if let Some(server) = args.server {
        client_config.server = server;
    }
    client_config.validate()?;

    info!("UDP TLS Pool client v{}", VERSION);

    let connector = build_connector(&client_config)?;
    let factory = SessionFactory::new(
        client_config.server.clone(),
        connector,
        client_config.pool_config(),
    );
    let listener = UdpListener::new(client_config.listener_config(), factory);

    let local_addr = listener
        .start()
        .await
        .context("Failed to bind UDP listener")?;
    info!(
        "Forwarding UDP {} -> {} ({} links per session)",
        local_addr, client_config.server, client_config.pool_size
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    tokio::select! {
        _ = listener.stop() => info!("Client stopped"),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted again, exiting without cleanup");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn build_connector(config: &ClientConfig) -> Result<Arc<dyn Connector>> {
    if config.insecure_plain_tcp {
        warn!("TLS disabled: links use plain TCP");
        return Ok(Arc::new(TcpConnector::new()));
    }

    let identity = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => Some((Path::new(cert), Path::new(key))),
        _ => None,
    };
    let tls_config = build_client_config(config.tls_ca.as_deref().map(Path::new), identity)
        .context("Failed to build TLS client context")?;
    let connector = TlsConnector::new(Arc::new(tls_config), config.tls_server_name.as_deref())?;

    Ok(Arc::new(connector))
}
