//! TCP listener: accept loop that turns every connection into a [`Session`].
//!
//! Each accepted connection gets a server-role session named
//! `tcp:<peer address>`.  The session registers itself with the hub and runs
//! on its own tasks, so the accept loop never waits on a client.
//!
//! Shutdown is triggered by a shared `AtomicBool` that is cleared by the
//! Ctrl+C handler in `main.rs`.  The loop polls it between accepts.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::application::scope::Access;
use crate::infrastructure::network::session::{Role, Session, SessionContext};

/// How long one `accept()` may block before the running flag is checked.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Binds `addr` and accepts connections until `running` is cleared.
///
/// `default_scope` is stamped on every accepted session.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound (e.g. the port is
/// already in use or the process lacks permission to bind).
pub async fn run_server(
    addr: SocketAddr,
    ctx: SessionContext,
    default_scope: String,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind CoT listener on {addr}"))?;

    info!("CoT relay listening on {}", listener.local_addr().unwrap_or(addr));
    serve(listener, ctx, default_scope, running).await;
    Ok(())
}

/// Runs the accept loop on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    ctx: SessionContext,
    default_scope: String,
    running: Arc<AtomicBool>,
) {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                accept_connection(stream, peer_addr, &ctx, &default_scope);
            }
            Ok(Err(e)) => {
                // Transient (e.g. out of file descriptors); keep serving.
                error!("accept error: {e}");
            }
            Err(_) => {
                // No connection within the poll window.
            }
        }
    }

    ctx.hub.close_all();
}

fn accept_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: &SessionContext,
    default_scope: &str,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {peer_addr}: {e}");
    }

    let name = format!("tcp:{peer_addr}");
    info!("new connection from {peer_addr}");
    Session::start(
        stream,
        name,
        Role::Server,
        Access::new(peer_addr.to_string(), default_scope),
        ctx,
    );
}
