//! Core server implementation and connection handling.
//!
//! This module contains the avatar server, the session core it drives, the
//! per-connection handlers and the collaborator feed.

pub mod coordinator;
pub mod core;
pub mod feed;
pub mod handlers;

pub use coordinator::SessionCore;
pub use self::core::AvatarServer;
pub use feed::FeedMessage;
