//! Storyweave client engine
//!
//! Keeps a live dialogue with the story server in sync: socket events are
//! reassembled into messages, applied to a key-path state store, presented in
//! order with a typewriter reveal and persisted across sessions.

pub mod logging;

pub mod api_client;
pub mod config;
pub mod engine;
pub mod error;
pub mod notice;
pub mod presentation;
pub mod session;
pub mod storage;
pub mod stores;
pub mod stream;
pub mod ws;

pub use api_client::ApiClient;
pub use config::EngineConfig;
pub use engine::{DialogueEngine, EngineParts};
pub use error::{EngineError, EngineResult};
pub use notice::{Notice, Notices};
pub use presentation::{PresentationOutcome, PresentationQueue, PresentationUnit, RenderTarget};
pub use session::{MemorySessionBackend, PersistKey, RestoreOutcome, SessionBackend, SessionBridge};
pub use storage::LocalStorage;
pub use stores::StateStore;
pub use stream::{StreamAssembler, StreamSession, StreamStatus};
pub use ws::{ConnectionManager, ConnectionState, EndpointConfig, MemoryTransport, ReconnectConfig};
