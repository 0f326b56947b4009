//! Canopy node daemon
//!
//! Loads PKI material and configuration, binds the UDP transport and
//! runs the overlay engine. Exit codes: 0 on a clean shutdown, 1 for
//! configuration problems, 2 when the packet device fails underneath a
//! running node.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use canopy_cert::{pem, CaPool};
use canopy_core::Node;
use canopy_crypto::{Curve, SecretKey};
use canopy_network::{ChannelTun, TunDevice, UdpTransportBuilder};

mod config;

use config::FileConfig;

/// Canopy - certificate-based overlay networking
#[derive(Parser)]
#[command(name = "canopy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "/etc/canopy/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node
    Start,
    /// Validate the configuration and certificates, then exit
    Check,
}

fn init_logging(level: &str) -> Result<()> {
    let level: Level = level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("setting tracing subscriber")?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("failed to initialize logging: {e:#}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e:#}");
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Start => runtime.block_on(run(&cli.config)),
        Commands::Check => runtime.block_on(check(&cli.config)),
    };
    std::process::exit(code);
}

/// Load PKI material named by the config
fn load_pki(
    config: &FileConfig,
) -> Result<(canopy_cert::Certificate, SecretKey, CaPool)> {
    let ca_pem = std::fs::read(&config.pki.ca)
        .with_context(|| format!("reading CA bundle {}", config.pki.ca.display()))?;
    let (pool, warnings) = CaPool::from_pem(&ca_pem).context("loading CA pool")?;
    for warning in warnings {
        warn!(%warning, "CA pool");
    }

    let cert_pem = std::fs::read(&config.pki.cert)
        .with_context(|| format!("reading certificate {}", config.pki.cert.display()))?;
    let cert = pem::cert_from_pem(&cert_pem).context("parsing node certificate")?;

    let key_pem = std::fs::read(&config.pki.key)
        .with_context(|| format!("reading private key {}", config.pki.key.display()))?;
    let (curve, key_bytes) = pem::private_key_from_pem(&key_pem).context("parsing private key")?;
    let key = match curve {
        Curve::Curve25519 => {
            let raw: [u8; 32] = key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("x25519 private key has wrong length"))?;
            SecretKey::curve25519_from_bytes(raw)
        }
        Curve::P256 => SecretKey::p256_from_bytes(&key_bytes).context("parsing p256 key")?,
    };

    Ok((cert, key, pool))
}

async fn build_node(config_path: &PathBuf) -> Result<Arc<Node>> {
    let config = FileConfig::load(config_path)?;
    let settings = config.to_settings()?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let (cert, key, pool) = load_pki(&config)?;

    let bind: SocketAddr = format!("{}:{}", config.listen.host, config.listen.port)
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen.host))?;
    let mut builder = UdpTransportBuilder::new(bind);
    if let Some(size) = config.listen.read_buffer {
        builder = builder.recv_buffer_size(size);
    }
    if let Some(size) = config.listen.write_buffer {
        builder = builder.send_buffer_size(size);
    }
    let transport = Arc::new(builder.build().await.context("binding udp socket")?);

    // Plaintext frames enter and leave through the TunDevice trait; the
    // in-memory device stands in until a platform backend is attached.
    let (tun, _frames_out) = ChannelTun::new("canopy0");
    warn!("no platform tun backend wired in; running with the in-memory device");
    let tun: Arc<dyn TunDevice> = Arc::new(tun);

    let node = Node::new(settings, cert, key, pool, transport, tun)
        .map_err(|e| anyhow::anyhow!("building node: {e}"))?;

    // Seed statically configured peers so first contact skips the
    // lighthouse round trip.
    for (vpn_ip, endpoints) in config.static_hosts()? {
        let pending = node.hostmap().add_pending(vpn_ip);
        pending.add_candidates(&endpoints);
    }

    Ok(node)
}

async fn run(config_path: &PathBuf) -> i32 {
    let node = match build_node(config_path).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "startup failed");
            return 1;
        }
    };

    let handles = node.run();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            node.close();
        }
        _ = node.fatal_signal() => {
            tracing::error!("fatal device error, exiting");
            node.close();
            return 2;
        }
    }

    for handle in handles {
        let _ = handle.await;
    }
    0
}

async fn check(config_path: &PathBuf) -> i32 {
    match build_node(config_path).await {
        Ok(node) => {
            info!(vpn_ip = %node.my_ip(), "configuration ok");
            node.close();
            0
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "configuration check failed");
            1
        }
    }
}
