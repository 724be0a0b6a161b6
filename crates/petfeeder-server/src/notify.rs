use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use petfeeder_shared::protocol::{Payload, RpcResponse};
use petfeeder_shared::types::{Connection, TransportClass, UserId};

use crate::transport::Transport;

/// Routes notifications and responses to the registered transports.
pub struct EventBus {
    transports: HashMap<TransportClass, Arc<dyn Transport>>,
}

impl EventBus {
    pub fn new(transports: &[Arc<dyn Transport>]) -> Self {
        Self {
            transports: transports
                .iter()
                .map(|t| (t.class(), Arc::clone(t)))
                .collect(),
        }
    }

    /// Send `event` to one user of one transport, every user of one
    /// transport, or everyone. Delivery failures are logged, never returned.
    pub async fn notify(
        &self,
        event: &str,
        transport: Option<&TransportClass>,
        user: Option<&UserId>,
        payload: Payload,
    ) {
        if !payload.is_binary() {
            debug!(
                transport = transport.map(TransportClass::as_str),
                user = user.map(UserId::as_str),
                event,
                data = %payload.to_json(),
                "notify"
            );
        }

        match transport {
            Some(class) => match self.transports.get(class) {
                Some(t) => deliver(t.as_ref(), event, &payload, user).await,
                None => warn!(transport = %class, event, "notification for unknown transport"),
            },
            None => {
                for t in self.transports.values() {
                    deliver(t.as_ref(), event, &payload, user).await;
                }
            }
        }
    }

    /// Notify every connected user on every transport.
    pub async fn broadcast(&self, event: &str, payload: Payload) {
        self.notify(event, None, None, payload).await;
    }

    /// Notify a single connection.
    pub async fn notify_connection(&self, event: &str, connection: &Connection, payload: Payload) {
        self.notify(
            event,
            Some(&connection.transport_class),
            Some(&connection.user_id),
            payload,
        )
        .await;
    }

    pub async fn respond(&self, connection: &Connection, response: RpcResponse) {
        let Some(transport) = self.transports.get(&connection.transport_class) else {
            warn!(connection = %connection, "response for unknown transport");
            return;
        };
        let id = response.id();
        if let Err(e) = transport.respond(&connection.user_id, response).await {
            warn!(connection = %connection, id, error = %e, "failed to deliver response");
        }
    }
}

async fn deliver(transport: &dyn Transport, event: &str, payload: &Payload, user: Option<&UserId>) {
    if let Err(e) = transport.notify(event, payload, user).await {
        warn!(transport = %transport.class(), event, error = %e, "failed to deliver notification");
    }
}
