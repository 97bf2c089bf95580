//! Wormhole client.
//!
//! Host mode (the default) allocates a code and waits; connector mode is
//! picked by passing a code, either with `-c`/`--code` or as a bare
//! positional argument shaped like `250-acorn-basin`.

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wormhole::app;
use wormhole::config::{parse_duration, ClientConfig};
use wormhole::console::Console;
use wormhole::words::{looks_like_code, Code};

#[derive(Parser, Debug)]
#[command(name = "wormhole", version)]
#[command(about = "Point-to-point file and message transfer with human-memorable codes")]
struct Cli {
    /// Full code from the host (connector mode), e.g. 250-acorn-basin
    code_arg: Option<String>,

    /// Same as the positional code
    #[arg(short = 'c', long = "code")]
    code: Option<String>,

    /// Control-plane base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    control: String,

    /// Optional overlay listen address, e.g. 0.0.0.0:0
    #[arg(long)]
    listen: Option<SocketAddrV4>,

    /// Directory to save incoming files
    #[arg(long, default_value = ".")]
    outdir: PathBuf,

    /// Require local confirmation (y/N) of the SAS on the dialing side
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    verify: bool,

    /// Print verbose logs
    #[arg(short, long)]
    verbose: bool,

    /// Deadline for control-plane requests, e.g. 5s
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    timeout: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match (&cli.code, &cli.code_arg) {
        (Some(c), _) => Some(c.clone()),
        (None, Some(pos)) if looks_like_code(pos) => Some(pos.clone()),
        (None, Some(pos)) => {
            bail!("{pos:?} does not look like a code (want e.g. 250-acorn-basin)")
        }
        (None, None) => None,
    };

    let cfg = ClientConfig {
        control_url: cli.control,
        out_dir: cli.outdir,
        verify: cli.verify,
        timeout: cli.timeout,
    };
    let console = Console::new();

    match code {
        Some(raw) => {
            let code = Code::parse(&raw)?;
            app::connect::run(cfg, code, cli.listen, console).await
        }
        None => app::host::run(cfg, cli.listen, console).await,
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "wormhole=debug" } else { "wormhole=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
