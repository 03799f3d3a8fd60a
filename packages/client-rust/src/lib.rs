//! `SyncWire` Client -- realtime record synchronization over a message
//! channel.
//!
//! The client keeps named JSON documents ("records") in sync with a
//! server: subscribe to a record and receive its current value plus every
//! subsequent update; write locally and the new version fans out to every
//! other client. The crate is organized around three pieces:
//!
//! - **Connection** ([`connection`]): the state machine over the message
//!   channel -- handshake, authentication, heartbeat, reconnection with
//!   backoff, and a conflating send buffer
//! - **Record** ([`record`]): the per-record sync state machine --
//!   readiness, the offline patch queue, optimistic versioned writes, and
//!   last-write-wins reconciliation
//! - **`RecordHandler`** ([`handler`]): the reference-counted registry
//!   with idle pruning and the promise-style `get`/`set`/`update`/
//!   `observe` convenience layer
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use syncwire_client::Client;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::connect("ws://localhost:6020")?;
//! client.login(json!({"username": "alice"})).await?;
//!
//! let record = client.records().get_record("user/alice")?;
//! record.when_ready().await?;
//! record.set_path("profile.name", json!("Alice"))?;
//! record.discard();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod handler;
mod listener;
pub mod options;
pub mod record;

pub use client::Client;
pub use connection::Connection;
pub use endpoint::{
    normalize_url, Endpoint, EndpointCommand, EndpointEvent, EndpointProvider, WsEndpointProvider,
};
pub use error::{ClientError, ErrorEvent, TransportError};
pub use events::{Emitter, SubscriptionId};
pub use handler::{ObserveStream, RecordHandler};
pub use options::ClientOptions;
pub use record::Record;

// Wire-level types callers interact with directly.
pub use syncwire_core::{ConnectionState, Event, Topic, Version};
