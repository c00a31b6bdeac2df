//! Home Affairs AI assistant client.
//!
//! Sends questions to the AI hub, decodes the streamed Server-Sent Events
//! answer and keeps a transcript with citations restricted to official
//! government domains.
//!
//! # Architecture
//!
//! - `sse` - incremental frame parser
//! - `dispatcher` - turn state machine emitting [`dispatcher::SessionEvent`]s
//! - `citations` - allow-list filtering of answer sources
//! - `client` - hub HTTP client (auth, conversation, answer stream)
//! - `session` - [`session::StreamingChatSession`], tying the above together
//! - `store` - persisted token, conversation id and transcript
//! - `relay` - same-origin relay in front of the hub
//! - `render` - terminal and HTML adapters
//!
//! # Usage
//!
//! ```rust,no_run
//! use homeaffairs::{AppConfig, HubClient, MemoryStore, StreamingChatSession};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AppConfig::from_env()?;
//! let store = Arc::new(MemoryStore::new());
//! let client = HubClient::new(config.clone(), store.clone());
//! let mut session = StreamingChatSession::new(&config, Box::new(client), store);
//! session
//!     .send("How do I apply for a hall booking?", |event| println!("{event:?}"))
//!     .await?;
//! # Ok(())
//! # }
//! ```
pub mod citations;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod relay;
pub mod render;
pub mod session;
pub mod sse;
pub mod store;
pub mod types;

pub use client::{ChatTransport, HubClient, QueryRequest};
pub use config::{AppConfig, Credential, RelayConfig};
pub use error::{ChatError, ChatResult};
pub use session::StreamingChatSession;
pub use store::{CredentialStore, FileStore, MemoryStore};
pub use types::{ChatMessage, Citation, Role};
