//! Client-facing transports.
//!
//! A transport owns its sockets and reports what happens on them as
//! [`TransportEvent`]s; the server answers through [`Transport::respond`] and
//! pushes notifications through [`Transport::notify`].

pub mod websocket;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use petfeeder_shared::protocol::{Payload, RpcResponse};
use petfeeder_shared::types::{Connection, TransportClass, UserId};

use crate::error::TransportError;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    UserConnect(Connection),
    UserDisconnect(Connection),
    /// A raw request envelope, validated by the server.
    RpcRequest {
        connection: Connection,
        payload: Value,
    },
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn class(&self) -> TransportClass;

    /// Start accepting clients. Returns once the transport is ready; the
    /// accept loop keeps running in the background.
    async fn run(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError>;

    /// Deliver a notification to one user, or to every user when `user` is
    /// `None`.
    async fn notify(
        &self,
        event: &str,
        payload: &Payload,
        user: Option<&UserId>,
    ) -> Result<(), TransportError>;

    async fn respond(&self, user: &UserId, response: RpcResponse) -> Result<(), TransportError>;
}
