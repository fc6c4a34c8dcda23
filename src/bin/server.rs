//! UDP TLS Pool Server
//!
//! Accepts pooled TLS streams, regroups them by session id and forwards each
//! session's datagrams to the configured UDP destination.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use udp_tls_pool::{
    config::{generate_example_config, Config, ServerConfig},
    logging::init_logging,
    server::{Dispatcher, StreamListener},
    transport::{build_server_config, Acceptor, TcpAcceptor, TlsAcceptor},
    VERSION,
};

/// UDP TLS Pool Server - UDP over pooled TLS streams
#[derive(Parser, Debug)]
#[command(name = "pool-server")]
#[command(about = "UDP TLS Pool Server - forwards pooled TLS streams to a UDP destination")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Stream listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// UDP destination (overrides config)
    #[arg(short, long)]
    destination: Option<String>,

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

    let mut server_config = config
        .server
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    if let Some(destination) = args.destination {
        server_config.destination = destination;
    }
    server_config.validate()?;

    info!("UDP TLS Pool server v{}", VERSION);

    let acceptor = build_acceptor(&server_config)?;
    let dispatcher = Arc::new(Dispatcher::new(server_config.dispatcher_config()));
    let listener = StreamListener::new(server_config.listen.clone(), acceptor, Arc::clone(&dispatcher))
        .with_handshake_timeout(server_config.handshake_deadline());

    let local_addr = listener
        .start()
        .await
        .context("Failed to bind to address")?;
    info!(
        "Accepting streams on {}, forwarding to {}",
        local_addr, server_config.destination
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let shutdown = async {
        listener.stop().await;
        dispatcher.stop().await;
    };
    tokio::select! {
        _ = shutdown => info!("Server stopped"),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted again, exiting without cleanup");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn build_acceptor(config: &ServerConfig) -> Result<Arc<dyn Acceptor>> {
    if config.insecure_plain_tcp {
        warn!("TLS disabled: accepting plain TCP");
        return Ok(Arc::new(TcpAcceptor::new()));
    }

    let (cert, key) = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => (cert, key),
        _ => return Err(anyhow!("server.tls_cert and server.tls_key are required")),
    };
    let tls_config = build_server_config(
        Path::new(cert),
        Path::new(key),
        config.tls_client_ca.as_deref().map(Path::new),
    )
    .context("Failed to build TLS server context")?;
    info!("TLS enabled with certificate: {}", cert);

    Ok(Arc::new(TlsAcceptor::new(Arc::new(tls_config))))
}
