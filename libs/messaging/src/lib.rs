//! # Switchboard Messaging
//!
//! Request/response messaging over pluggable brokers.
//!
//! - [`QueueClient`]: publishes requests to every send route and awaits the
//!   correlated reply
//! - [`QueueListener`]: one resilient subscription with backpressure, fault
//!   pause and reconnect, written once over the broker traits
//! - [`QueueServer`]: listeners plus the reply fan-out path and lifecycle
//!   events for a hosting process
//!
//! ```no_run
//! use messaging::{QueueClient, RequestMessage};
//! use network::InMemoryBroker;
//! use queue_config::{ClientOptions, SelectionContext};
//! use std::sync::Arc;
//!
//! # async fn demo(options: ClientOptions) -> network::Result<()> {
//! let client = QueueClient::new(options, Arc::new(InMemoryBroker::new()), SelectionContext::from_env())?;
//! let id = client.send(&RequestMessage::new(b"ping".to_vec())).await?;
//! let response = client.receive(id).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod listener;
pub mod message;
pub mod server;

pub use client::QueueClient;
pub use listener::{
    InboundMessage, ListenerHandle, ListenerStats, ListenerStatsSnapshot, ListenerStatus,
    MessageProcessor, QueueListener,
};
pub use message::{RequestHeader, RequestMessage, ResponseHeader, ResponseMessage};
pub use server::{
    reply_name, QueueServer, ReplyContext, RequestBody, RequestHandler, ResponseBody,
    ResponseSender, ServerEvent, ServerRequest, ServerResponse,
};
