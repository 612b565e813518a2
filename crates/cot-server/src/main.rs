//! cot-relay entry point.
//!
//! Loads the configuration, wires the routing hub to the network
//! listeners and runs until Ctrl+C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ Cli::into_app_config()   -- TOML file + flag / env overrides
//!  └─ RoutingHub + RelayHandler + DefaultScopePolicy
//!  └─ start services
//!       ├─ run_upstream()       (Tokio task, only if configured)
//!       └─ run_server()         (accept loop, until Ctrl+C)
//! ```
//!
//! # Usage
//!
//! ```text
//! cot-server [--config cot-relay.toml] [--bind 0.0.0.0] [--port 8087]
//!            [--upstream host:port] [--log-level debug] [--write-config]
//! ```
//!
//! Every flag can also come from the environment (`COT_CONFIG`, `COT_BIND`,
//! `COT_PORT`, `COT_UPSTREAM`, `COT_LOG`).

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cot_server::application::relay::RelayHandler;
use cot_server::application::routing::RoutingHub;
use cot_server::application::scope::DefaultScopePolicy;
use cot_server::infrastructure::network::session::SessionContext;
use cot_server::infrastructure::network::tcp_server::run_server;
use cot_server::infrastructure::network::upstream::{parse_upstream, run_upstream};
use cot_server::infrastructure::storage::config::{
    load_config, save_config, AppConfig, DEFAULT_CONFIG_FILE,
};

// ── CLI definition ────────────────────────────────────────────────────────────

/// Command-line arguments.  Flags left unset keep the value from the file.
#[derive(Debug, Parser)]
#[command(
    name = "cot-server",
    about = "Cursor-on-Target relay: routes CoT events between TCP clients",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE, env = "COT_CONFIG")]
    config: PathBuf,

    /// IP address to bind the listener to.
    #[arg(long, env = "COT_BIND")]
    bind: Option<String>,

    /// TCP port for CoT clients.
    #[arg(long, env = "COT_PORT")]
    port: Option<u16>,

    /// Relay to connect to, `host:port` or `host:port:tcp`.
    #[arg(long, env = "COT_UPSTREAM")]
    upstream: Option<String>,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, env = "COT_LOG")]
    log_level: Option<String>,

    /// Write the effective configuration to `--config` and exit.
    #[arg(long)]
    write_config: bool,
}

impl Cli {
    /// Loads the configuration file and applies the flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if `--upstream` is not a valid address.
    fn into_app_config(&self) -> anyhow::Result<AppConfig> {
        let cfg = load_config(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))?;
        self.apply_overrides(cfg)
    }

    fn apply_overrides(&self, mut cfg: AppConfig) -> anyhow::Result<AppConfig> {
        if let Some(bind) = &self.bind {
            cfg.network.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            cfg.network.tcp_port = port;
        }
        if let Some(upstream) = &self.upstream {
            cfg.network.upstream = Some(upstream.clone());
        }
        if let Some(level) = &self.log_level {
            cfg.server.log_level = level.clone();
        }
        if let Some(upstream) = &cfg.network.upstream {
            parse_upstream(upstream)?;
        }
        Ok(cfg)
    }
}

/// Socket address of the listener described by `cfg`.
fn listen_addr(cfg: &AppConfig) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = cfg
        .network
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address: '{}'", cfg.network.bind_address))?;
    Ok(SocketAddr::new(ip, cfg.network.tcp_port))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = cli.into_app_config()?;

    if cli.write_config {
        save_config(&cli.config, &cfg)
            .with_context(|| format!("failed to write {}", cli.config.display()))?;
        println!("wrote {}", cli.config.display());
        return Ok(());
    }

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.server.log_level)),
        )
        .init();

    let addr = listen_addr(&cfg)?;
    info!("cot-relay starting; uid={}, listen={addr}", cfg.server.uid);

    let hub = Arc::new(RoutingHub::new(cfg.codec()));
    let ctx = SessionContext {
        hub: Arc::clone(&hub),
        handler: Arc::new(RelayHandler::new(Arc::clone(&hub))),
        policy: Arc::new(DefaultScopePolicy),
        settings: cfg.session_settings(),
        local_uid: cfg.server.uid.clone(),
    };

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    // ── Upstream link ─────────────────────────────────────────────────────────
    if let Some(upstream) = &cfg.network.upstream {
        let target = parse_upstream(upstream)?;
        info!("upstream configured: {target}");
        tokio::spawn(run_upstream(
            target,
            ctx.clone(),
            cfg.routing.default_scope.clone(),
            Arc::clone(&running),
        ));
    }

    run_server(addr, ctx, cfg.routing.default_scope.clone(), running).await?;

    info!("cot-relay stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
