use bifrost::config::Config;
use bifrost::handler::QueryRouter;
use bifrost::http_server::run_http_server;
use bifrost::server::{run_tcp_server, run_udp_server};
use bifrost::store::RecordStore;
use bifrost::upstream::{Exchange, UpstreamClient};
use clap::Parser;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bifrost", version, about = "Authoritative and forwarding DNS responder")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "/etc/bifrost/config.json")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    info!(
        "zone {:?}, {} record(s), {} blocklist fragment(s), {} nameserver(s)",
        config.name,
        config.records.len(),
        config.blocks.len(),
        config.nameservers.len()
    );

    let store = RecordStore::from_map(config.records.clone());
    let client: Arc<dyn Exchange> = Arc::new(UpstreamClient::new());
    let router = Arc::new(QueryRouter::new(&config, store.clone(), client));

    let udp_socket = UdpSocket::bind(config.bind_addr()).await?;
    let tcp_listener = TcpListener::bind(config.bind_addr()).await?;
    let http_listener = TcpListener::bind(config.http_bind_addr()).await?;
    info!("DNS on {}", config.bind_addr());

    let (shutdown_tx, _) = broadcast::channel(1);

    let udp_task = tokio::spawn(run_udp_server(
        udp_socket,
        router.clone(),
        shutdown_tx.subscribe(),
    ));
    let tcp_task = tokio::spawn(run_tcp_server(
        tcp_listener,
        router.clone(),
        shutdown_tx.subscribe(),
    ));
    let http_task = tokio::spawn(run_http_server(
        http_listener,
        store,
        config.secret.clone(),
        shutdown_tx.subscribe(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    for task in [udp_task, tcp_task, http_task] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("server task failed: {}", e),
            Err(e) => error!("server task panicked: {}", e),
        }
    }

    Ok(())
}
