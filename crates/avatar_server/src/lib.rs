//! # Avatar Server
//!
//! Real-time avatar distribution core for Sculptor. Game clients connect
//! over WebSocket, authenticate with a token and then receive the avatars of
//! every player the game world reports as nearby. Changed avatars are pushed
//! to everyone currently viewing their owner.
//!
//! ## Architecture Overview
//!
//! * **Session Registry** ([`session`]) - One authoritative record per
//!   connected identity, plus the directed "viewer sees target" edges
//! * **Avatar Cache** ([`cache`]) - Byte-bounded LRU over the storage plugin,
//!   coalescing concurrent misses into one fetch
//! * **Proximity Router** ([`proximity`]) - Turns enter/leave events into
//!   symmetric edges and first deliveries
//! * **Distribution Engine** ([`distribution`]) - Queues avatar payloads,
//!   discards and relayed pings onto per-connection outbound queues
//! * **Session Core** ([`server`]) - Owns connection lifecycles and routes
//!   every per-session failure into that session's close
//!
//! ## Message Flow
//!
//! 1. Client sends a binary `Handshake` frame carrying its token
//! 2. The authentication plugin resolves the token to a player identity
//! 3. The session is admitted and an `Auth` frame is queued
//! 4. Proximity events link sessions; each new edge triggers a delivery
//! 5. Avatars stream as chunk frames followed by a completion frame
//!
//! ## Error Handling
//!
//! The server uses structured error types ([`ServerError`] for the network
//! surface, [`error::SessionError`], [`error::AvatarError`] and
//! [`error::DeliveryError`] inside the core). No per-session error ever
//! propagates past the session core; it closes the affected session only.
//!
//! ## Thread Safety
//!
//! * Sessions are stored in a `DashMap`; each session's edges sit behind its
//!   own async mutex, and two-session operations lock in id order
//! * The cache is shared through `Arc` and coalesces fetches with shared futures
//! * Outbound queues are bounded and never awaited from the core

// Re-export core types and functions for easy access
pub use config::ServerConfig;
pub use error::ServerError;
pub use server::{AvatarServer, SessionCore};
pub use shutdown::ShutdownState;
pub use types::{AvatarKey, AvatarVersion, ContentHash, PlayerIdentity, SessionId};
pub use utils::{create_server, create_server_with_config};

// Public module declarations
pub mod cache;
pub mod config;
pub mod distribution;
pub mod error;
pub mod plugins;
pub mod protocol;
pub mod proximity;
pub mod security;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod stats;
pub mod types;
pub mod utils;

// Internal modules (not part of public API)
mod tests;
