//! Socket connection to the story server.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               ConnectionManager              │
//! │  state machine, reconnect loop, handlers     │
//! └──────────────────────────────────────────────┘
//!                        │ Transport::open
//!            ┌───────────┴───────────┐
//!            ▼                       ▼
//!     ┌─────────────┐         ┌───────────────┐
//!     │ WsTransport │         │MemoryTransport│
//!     │ (socket)    │         │ (in-process)  │
//!     └─────────────┘         └───────────────┘
//! ```
//!
//! Handlers never touch the socket; they receive decoded payloads in arrival
//! order and typically forward them to the engine's event loop.

mod connection;
mod manager;
mod memory;

pub use connection::{
    ConnectionState, EndpointConfig, ReconnectConfig, Transport, TransportLink, WsTransport,
};
pub use manager::{ConnectionManager, Handler, HandlerId};
pub use memory::MemoryTransport;
