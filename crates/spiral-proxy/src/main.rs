//! Spiral Proxy entry point.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use spiral_common::proto::SocketAddress;
use spiral_proxy::core::Proxy;
use spiral_proxy::keys;
use spiral_proxy::plugin::capture::Capture;
use spiral_proxy::plugin::log::VerboseLog;
use tracing::info;

/// Starts the proxy with required files in the key directory.
///
/// The expected files are 'ki_keys.json', a dump of recent client
/// public keys, and 'injected_keys.json', a controlled key pair for the
/// client connecting to the proxy. Optionally, if a 'ClientSig.dec.bin'
/// file exists, it will be used to answer handshake challenges.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Directory holding the key material files.
    key_dir: PathBuf,

    /// The host interface to bind sockets to.
    #[arg(long)]
    host: Option<String>,

    /// The Login Server IP.
    #[arg(short, long, default_value = "login.us.wizard101.com")]
    login: String,

    /// The TCP port of the Login Server.
    #[arg(short, long, default_value_t = 12000)]
    port: u16,

    /// Captures packets to a pcapng file.
    #[arg(short, long)]
    capture: Option<PathBuf>,

    /// Enables verbose packet logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let key_chain = keys::load_key_chain(&args.key_dir)
        .with_context(|| format!("loading key bundles from {}", args.key_dir.display()))?;
    let client_sig = keys::load_client_sig(&args.key_dir)?;
    if client_sig.is_some() {
        info!("Loaded ClientSig artifact; handshake challenges will be checked");
    }

    let mut proxy = Proxy::new(args.host, key_chain, client_sig);

    if let Some(path) = &args.capture {
        proxy.add_plugin(Capture::plugin(path)?);
        info!("Capturing packets to {}", path.display());
    }

    if args.verbose {
        proxy.add_plugin(VerboseLog::plugin());
    }

    // Spawn the initial shard to proxy the login server.
    let login = SocketAddress::new(args.login, args.port);
    let local = proxy.spawn_shard(login.clone()).await?;
    info!("Proxying login server {} on {}", login, local);

    proxy.run().await;

    Ok(())
}
