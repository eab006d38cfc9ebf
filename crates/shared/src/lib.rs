//! Shared types for the storyweave dialogue client: data model, transport
//! protocol and REST error types.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
