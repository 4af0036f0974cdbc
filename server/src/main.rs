use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::error::ServerError;
use server::network::ZoneServer;
use server::persistence::{run_event_writer, EventLog, InMemorySessionStore, JsonLinesStore};
use server::zone::cluster::Cluster;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

/// Main-method of the application.
/// Parses command-line arguments, builds the zone cluster and runs every zone
/// on its own task until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), ServerError> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// JSON config file; flags below override it
        #[clap(short, long)]
        config: Option<PathBuf>,
        /// Server IP address to bind to
        #[clap(short = 'H', long)]
        host: Option<String>,
        /// Port of zone 0; zone n listens on port + n
        #[clap(short, long)]
        port: Option<u16>,
        /// Tick rate (updates per second)
        #[clap(short, long)]
        tick_rate: Option<u32>,
        /// Zone grid columns
        #[clap(long)]
        zones_x: Option<u32>,
        /// Zone grid rows
        #[clap(long)]
        zones_z: Option<u32>,
        /// Maximum clients per zone
        #[clap(short, long)]
        max_clients: Option<usize>,
        /// Log filter, overridden by RUST_LOG
        #[clap(short, long, default_value = "info")]
        log_level: String,
    }

    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.network.bind_address = host;
    }
    if let Some(port) = args.port {
        config.network.port = port;
    }
    if let Some(tick_rate) = args.tick_rate {
        config.tick.tick_rate = tick_rate;
    }
    if let Some(zones_x) = args.zones_x {
        config.migration.zones_x = zones_x;
    }
    if let Some(zones_z) = args.zones_z {
        config.migration.zones_z = zones_z;
    }
    if let Some(max_clients) = args.max_clients {
        config.network.max_clients = max_clients;
    }
    config.validate()?;

    let zone_count = config.migration.zones_x * config.migration.zones_z;
    if config.network.port as u32 + zone_count > u16::MAX as u32 {
        return Err(ServerError::Config(format!(
            "{} zones do not fit above port {}",
            zone_count, config.network.port
        )));
    }

    let (events, event_rx) = EventLog::new(config.persistence.queue_capacity);
    let writer = tokio::spawn(run_event_writer(
        event_rx,
        JsonLinesStore::new(config.persistence.event_log_path.clone()),
        config.persistence.batch_size,
        Duration::from_millis(config.persistence.flush_interval_ms),
    ));

    let cluster = Cluster::new(&config, InMemorySessionStore::new(), events)?;
    info!(
        "Starting {} zones ({}x{}) at {} Hz",
        cluster.zones().len(),
        config.migration.zones_x,
        config.migration.zones_z,
        config.tick.tick_rate
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for zone in cluster.into_zones() {
        let address = format!(
            "{}:{}",
            config.network.bind_address,
            config.network.port + zone.id().0 as u16
        );
        let server = ZoneServer::bind(&address, zone, &config).await?;
        let mut shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(server.run(async move {
            let _ = shutdown.changed().await;
        })));
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, shutting down gracefully...");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        match handle.await {
            Ok(Err(e)) => error!("Zone stopped with error: {}", e),
            Err(e) => error!("Zone task panicked: {}", e),
            Ok(Ok(())) => {}
        }
    }

    // Every zone has dropped its event log handle, so the writer flushes and exits
    match writer.await {
        Ok(stats) => info!(
            "Event log closed: {} written, {} discarded",
            stats.written, stats.discarded
        ),
        Err(e) => error!("Event writer panicked: {}", e),
    }
    Ok(())
}
