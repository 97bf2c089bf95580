//! Wormhole server: control plane plus overlay rendezvous in one process.

use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use iroh::NodeAddr;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wormhole::config::{parse_duration, RZV_ALPN};
use wormhole::server::http::{spawn_sweeper, ControlInfo};
use wormhole::server::rendezvous::{self, RendezvousDb};
use wormhole::server::{identity, router, ControlState, IpLimiter, Store};

#[derive(Parser, Debug)]
#[command(name = "wormhole-server", version)]
#[command(about = "Code allocation, claim matching, and rendezvous for wormhole clients")]
struct Cli {
    /// Overlay listen address
    #[arg(long, default_value = "0.0.0.0:4001")]
    listen: SocketAddrV4,

    /// Database file (nameplates + rendezvous tables)
    #[arg(long, default_value = "./wormhole-server.db")]
    db: PathBuf,

    /// HTTP control-plane listen address
    #[arg(long, default_value = "127.0.0.1:8080")]
    control_listen: SocketAddr,

    /// Rendezvous namespace
    #[arg(long, default_value = "wormhole")]
    rendezvous_namespace: String,

    /// Nameplate lifetime, e.g. 10m or 30m
    #[arg(long, default_value = "30m", value_parser = parse_duration)]
    nameplate_ttl: Duration,

    /// Nameplate digit count (3 or 4)
    #[arg(long, default_value_t = 3)]
    nameplate_digits: u32,

    /// Bootstrap peers handed to clients (optional)
    #[arg(long, value_delimiter = ',')]
    bootstrap: Vec<String>,

    /// Public announce addresses; overrides the bound sockets when set
    #[arg(long, value_delimiter = ',')]
    public_addrs: Vec<SocketAddr>,

    /// Identity key file
    #[arg(long, default_value = "./wormhole-server.key")]
    identity: PathBuf,

    /// Per-IP request window
    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    rate_req_window: Duration,

    /// Max requests per IP inside the request window
    #[arg(long, default_value_t = 120)]
    rate_max_reqs: usize,

    /// Per-IP failure window
    #[arg(long, default_value = "10m", value_parser = parse_duration)]
    rate_fail_window: Duration,

    /// Max failures per IP inside the failure window
    #[arg(long, default_value_t = 30)]
    rate_max_fails: usize,

    /// Print verbose logs
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if !(3..=4).contains(&cli.nameplate_digits) {
        bail!("--nameplate-digits must be 3 or 4");
    }
    if cli.nameplate_ttl.is_zero() {
        bail!("--nameplate-ttl must be positive");
    }

    // Overlay endpoint with the persistent server identity.
    let key = identity::load_or_create(&cli.identity)?;
    let endpoint = wormhole::net::Endpoint::bind_with_key(
        key,
        vec![RZV_ALPN.to_vec()],
        Some(cli.listen),
    )
    .await
    .context("bind overlay endpoint")?;

    let node_addr = endpoint.node_addr().await?;
    let advertised = if cli.public_addrs.is_empty() {
        node_addr.clone()
    } else {
        NodeAddr::new(endpoint.device_id()).with_direct_addresses(cli.public_addrs.clone())
    };
    let relay_addrs: Vec<String> = node_addr
        .relay_url
        .iter()
        .map(|u| u.to_string())
        .collect();

    println!("wormhole-server up.");
    println!("PeerID: {}", endpoint.device_id());
    println!("Overlay addresses:");
    for a in &advertised.direct_addresses {
        println!("  {a}");
    }

    // Databases: two tables, one file.
    let store = Store::open(&cli.db).context("open control db")?;
    let rzv_db = RendezvousDb::open(&cli.db).context("open rendezvous db")?;

    // Rendezvous service on the overlay.
    tokio::spawn(rendezvous::serve(endpoint.iroh().clone(), rzv_db));

    // Periodic cleanup of expired/consumed nameplates.
    let sweeper = spawn_sweeper(store.clone(), Duration::from_secs(60));

    // HTTP control plane.
    let state = Arc::new(ControlState {
        store,
        limiter: IpLimiter::new(
            cli.rate_req_window,
            cli.rate_max_reqs,
            cli.rate_fail_window,
            cli.rate_max_fails,
        ),
        info: ControlInfo {
            rzv_namespace: cli.rendezvous_namespace,
            rendezvous_addrs: vec![serde_json::to_string(&advertised)?],
            relay_addrs,
            bootstrap: cli.bootstrap,
        },
        ttl: cli.nameplate_ttl,
        digits: cli.nameplate_digits,
    });

    let listener = tokio::net::TcpListener::bind(cli.control_listen)
        .await
        .with_context(|| format!("bind control plane on {}", cli.control_listen))?;
    info!(addr = %cli.control_listen, "control plane listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .context("http server")?;

    sweeper.abort();
    endpoint.close().await;
    println!("bye");
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "wormhole=debug,tower_http=debug"
    } else {
        "wormhole=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
