//! Collaborator plugins the server depends on but does not implement:
//! token verification and avatar storage.
//!
//! Both are traits so deployments can supply their own backends; the
//! bundled implementations cover development and tests.

pub mod auth;
pub mod storage;

pub use auth::{AuthError, Authenticator, StaticTokenAuthenticator};
pub use storage::{AvatarStore, DirectoryStore, MemoryStore, StorageEvent, StoreError};
