//! What happens to a message once a session has decoded it.
//!
//! A session knows nothing about other sessions; it hands every event that
//! is not session-local control traffic to its [`MessageHandler`].  The
//! relay's handler, [`RelayHandler`], logs the event by kind and routes it
//! through the [`RoutingHub`].

use std::sync::Arc;

use async_trait::async_trait;
use cot_core::CotMessage;
use tracing::{debug, info};

use crate::application::routing::RoutingHub;

/// Callbacks a session makes into the application.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// An event arrived on a session.  `msg.from` and `msg.scope` are set.
    async fn on_message(&self, msg: CotMessage);

    /// A session saw a contact uid for the first time.
    async fn on_new_contact(&self, session: &str, uid: &str, callsign: &str);

    /// A session has finished tearing down.
    async fn on_remove(&self, session: &str);
}

/// Routes every inbound event through the hub.
pub struct RelayHandler {
    hub: Arc<RoutingHub>,
}

impl RelayHandler {
    pub fn new(hub: Arc<RoutingHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl MessageHandler for RelayHandler {
    async fn on_message(&self, msg: CotMessage) {
        if msg.is_chat() {
            info!(
                "chat {} from {} ({}) to {:?}",
                msg.uid(),
                msg.from,
                msg.callsign(),
                msg.dest_callsigns()
            );
        } else if msg.is_file_transfer() {
            info!("file transfer {} from {}", msg.uid(), msg.from);
        } else if msg.is_control() {
            debug!("control {} {} from {}", msg.event_type(), msg.uid(), msg.from);
        } else if msg.event.is_stale() {
            debug!("stale {} {} from {}", msg.event_type(), msg.uid(), msg.from);
        } else {
            debug!("{} {} ({}) from {}", msg.event_type(), msg.uid(), msg.callsign(), msg.from);
        }

        self.hub.dispatch(&msg);
    }

    async fn on_new_contact(&self, session: &str, uid: &str, callsign: &str) {
        info!("new contact {uid} ({callsign}) on {session}");
    }

    async fn on_remove(&self, session: &str) {
        info!("session {session} removed; {} remaining", self.hub.len());
    }
}
