//! Outgoing link to another relay.
//!
//! The connector dials the configured upstream, runs a client-role session
//! over the connection until it ends, and dials again after a pause.  Traffic
//! from the upstream flows into the same message handler as local clients,
//! and local traffic is routed to the upstream like to any other session.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{error, info};

use crate::application::scope::Access;
use crate::infrastructure::network::session::{Role, Session, SessionContext};

/// Pause between connection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Splits `host:port` or `host:port:tcp` into a dialable `host:port`.
///
/// # Errors
///
/// Returns an error for any other shape or transport.
pub fn parse_upstream(addr: &str) -> anyhow::Result<String> {
    let parts: Vec<&str> = addr.rsplitn(3, ':').collect();
    match parts.as_slice() {
        [port, host] if !host.is_empty() => {
            port.parse::<u16>()
                .with_context(|| format!("invalid upstream port in '{addr}'"))?;
            Ok(format!("{host}:{port}"))
        }
        ["tcp", port, host] if !host.is_empty() => {
            port.parse::<u16>()
                .with_context(|| format!("invalid upstream port in '{addr}'"))?;
            Ok(format!("{host}:{port}"))
        }
        [proto, _, _] if proto.parse::<u16>().is_err() => {
            bail!("unsupported upstream transport '{proto}' in '{addr}'")
        }
        _ => bail!("invalid upstream address '{addr}', expected host:port"),
    }
}

/// Keeps a client-role session to `addr` alive until `running` is cleared.
pub async fn run_upstream(
    addr: String,
    ctx: SessionContext,
    scope: String,
    running: Arc<AtomicBool>,
) {
    let name = format!("upstream:{addr}");

    while running.load(Ordering::Relaxed) {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                info!("connected to upstream {addr}");
                let access = Access::new("upstream", scope.clone()).with_read_scopes(["*"]);
                let session = Session::start(stream, name.clone(), Role::Client, access, &ctx);
                session.closed().await;
                info!("upstream {addr} disconnected");
            }
            Ok(Err(e)) => error!("cannot connect to upstream {addr}: {e}"),
            Err(_) => error!("timed out connecting to upstream {addr}"),
        }

        if running.load(Ordering::Relaxed) {
            sleep(RECONNECT_DELAY).await;
        }
    }
}
