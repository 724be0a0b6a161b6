//! # petfeeder-shared
//!
//! Types shared by every petfeeder crate: connection identities, schedule and
//! feeding value types, the RPC wire protocol, notification names and the RPC
//! error taxonomy.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ConflictError, RpcError};
pub use protocol::{Payload, RpcRequest, RpcResponse};
pub use types::{
    Connection, EventKind, FeedingRecord, GalleryState, ScheduleEntry, ScheduledFeeding,
    TransportClass, UserId,
};
