//! hearth-client - Persistent WebSocket client for home-automation hubs
//!
//! Maintains one authenticated, self-healing connection to a hub's JSON
//! command API: commands with correlated results, event subscriptions that
//! survive reconnects, and shared live-updating state collections.
//!
//! ## Layers
//!
//! - **Transport**: WebSocket framing behind swappable connector traits
//! - **Auth**: credential sources with single-flight token refresh
//! - **Session**: command correlation, event dispatch, reconnect recovery
//! - **Store / Collection**: observable caches bound to hub subscriptions
//! - **Entities**: live entity-state mirror built on the collection layer
//!
//! A minimal consumer connects, subscribes, and reads:
//!
//! ```no_run
//! use std::sync::Arc;
//! use hearth_client::{LongLivedToken, Session, SessionConfig};
//!
//! # async fn run() -> hearth_client::Result<()> {
//! let session = Session::connect(
//!     SessionConfig {
//!         url: "ws://hub.local:8123/api/websocket".into(),
//!         ..SessionConfig::default()
//!     },
//!     Arc::new(LongLivedToken::new("token")),
//! )
//! .await?;
//!
//! let _watch = hearth_client::subscribe_entities(&session, |entities| {
//!     println!("{} entities", entities.len());
//! })
//! .await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod collection;
pub mod entities;
pub mod error;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;

mod handshake;

pub use auth::{Credentials, LongLivedToken};
pub use collection::{
    get_collection, Collection, CollectionOptions, CollectionSubscription, FetchFn, SubscribeFn,
};
pub use entities::{
    entity_collection, get_states, subscribe_entities, EntityContext, EntityMap, EntityState,
};
pub use error::{HearthError, Result};
pub use session::{
    ListenerId, Session, SessionConfig, SessionEvent, SubscribeOptions, Unsubscriber,
};
pub use store::{Store, StoreSubscription};
