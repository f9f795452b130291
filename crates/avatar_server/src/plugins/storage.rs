//! Avatar storage collaborator boundary and the stores shipped with the server.

use crate::types::{AvatarKey, AvatarVersion, PlayerIdentity};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// File extension of stored avatar bundles.
pub const AVATAR_EXTENSION: &str = "moon";

/// Failure reported by an [`AvatarStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("avatar not found")]
    NotFound,

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Notification pushed by the storage plugin when an avatar changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    /// The owner equipped a new avatar version.
    AvatarChanged {
        owner: PlayerIdentity,
        version: AvatarVersion,
    },
    /// The avatar was deleted or banned and must disappear from every client.
    AvatarRemoved {
        owner: PlayerIdentity,
        version: AvatarVersion,
    },
}

/// Read access to stored avatars.
#[async_trait]
pub trait AvatarStore: Send + Sync {
    /// Loads the payload of one avatar version.
    async fn fetch_avatar(
        &self,
        owner: &PlayerIdentity,
        version: AvatarVersion,
    ) -> Result<Bytes, StoreError>;

    /// The version the owner currently has equipped, if any.
    async fn current_version(
        &self,
        owner: &PlayerIdentity,
    ) -> Result<Option<AvatarVersion>, StoreError>;
}

/// In-memory store, for embedding and tests.
///
/// Counts fetches and can simulate latency or an outage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    avatars: DashMap<AvatarKey, Bytes>,
    equipped: DashMap<PlayerIdentity, AvatarVersion>,
    fetches: AtomicUsize,
    latency: Option<Duration>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every fetch by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Stores `payload` as `version` of `owner` and equips it.
    pub fn put(&self, owner: impl Into<PlayerIdentity>, version: AvatarVersion, payload: impl Into<Bytes>) {
        let owner = owner.into();
        self.avatars
            .insert(AvatarKey::new(owner.clone(), version), payload.into());
        self.equipped.insert(owner, version);
    }

    /// Deletes one version; unequips it if it was current.
    pub fn remove(&self, owner: &PlayerIdentity, version: AvatarVersion) {
        self.avatars.remove(&AvatarKey::new(owner.clone(), version));
        self.equipped.remove_if(owner, |_, current| *current == version);
    }

    /// Makes every call fail with [`StoreError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `fetch_avatar` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AvatarStore for MemoryStore {
    async fn fetch_avatar(
        &self,
        owner: &PlayerIdentity,
        version: AvatarVersion,
    ) -> Result<Bytes, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.check_available()?;
        self.avatars
            .get(&AvatarKey::new(owner.clone(), version))
            .map(|payload| payload.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn current_version(
        &self,
        owner: &PlayerIdentity,
    ) -> Result<Option<AvatarVersion>, StoreError> {
        self.check_available()?;
        Ok(self.equipped.get(owner).map(|version| *version.value()))
    }
}

/// Store reading avatar bundles from disk, laid out as
/// `<root>/<identity>/<version>.moon`. The highest version present is the
/// equipped one.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes a bundle, creating the owner's directory when needed.
    pub async fn write_avatar(
        &self,
        owner: &PlayerIdentity,
        version: AvatarVersion,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        let dir = self.owner_dir(owner)?;
        tokio::fs::create_dir_all(&dir).await.map_err(unavailable)?;
        tokio::fs::write(avatar_file(&dir, version), payload)
            .await
            .map_err(unavailable)
    }

    /// Identities become path components, so anything that could escape
    /// the root is treated as a missing avatar.
    fn owner_dir(&self, owner: &PlayerIdentity) -> Result<PathBuf, StoreError> {
        let name = owner.as_str();
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            debug!("Refusing unsafe identity {:?} for directory lookup", name);
            return Err(StoreError::NotFound);
        }
        Ok(self.root.join(name))
    }
}

fn avatar_file(dir: &Path, version: AvatarVersion) -> PathBuf {
    dir.join(format!("{}.{}", version.0, AVATAR_EXTENSION))
}

fn unavailable(error: std::io::Error) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

#[async_trait]
impl AvatarStore for DirectoryStore {
    async fn fetch_avatar(
        &self,
        owner: &PlayerIdentity,
        version: AvatarVersion,
    ) -> Result<Bytes, StoreError> {
        let path = avatar_file(&self.owner_dir(owner)?, version);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn current_version(
        &self,
        owner: &PlayerIdentity,
    ) -> Result<Option<AvatarVersion>, StoreError> {
        let dir = match self.owner_dir(owner) {
            Ok(dir) => dir,
            Err(StoreError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(e)),
        };

        let mut latest = None;
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(AVATAR_EXTENSION) {
                continue;
            }
            let version = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok());
            if let Some(version) = version {
                latest = latest.max(Some(AvatarVersion(version)));
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_tracks_equipped_version() {
        let store = MemoryStore::new();
        let alice = PlayerIdentity::from("alice");
        store.put("alice", AvatarVersion(1), &b"one"[..]);
        store.put("alice", AvatarVersion(2), &b"two"[..]);

        assert_eq!(store.current_version(&alice).await, Ok(Some(AvatarVersion(2))));
        assert_eq!(
            store.fetch_avatar(&alice, AvatarVersion(1)).await,
            Ok(Bytes::from_static(b"one"))
        );

        store.remove(&alice, AvatarVersion(2));
        assert_eq!(store.current_version(&alice).await, Ok(None));
        assert_eq!(
            store.fetch_avatar(&alice, AvatarVersion(2)).await,
            Err(StoreError::NotFound)
        );

        store.set_unavailable(true);
        assert!(matches!(
            store.fetch_avatar(&alice, AvatarVersion(1)).await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.fetch_count(), 3);
    }

    #[tokio::test]
    async fn directory_store_reads_moon_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        let bob = PlayerIdentity::from("bob");

        assert_eq!(store.current_version(&bob).await, Ok(None));

        store.write_avatar(&bob, AvatarVersion(3), b"v3").await.unwrap();
        store.write_avatar(&bob, AvatarVersion(12), b"v12").await.unwrap();
        tokio::fs::write(dir.path().join("bob").join("notes.txt"), b"ignored")
            .await
            .unwrap();

        assert_eq!(store.current_version(&bob).await, Ok(Some(AvatarVersion(12))));
        assert_eq!(
            store.fetch_avatar(&bob, AvatarVersion(3)).await,
            Ok(Bytes::from_static(b"v3"))
        );
        assert_eq!(
            store.fetch_avatar(&bob, AvatarVersion(4)).await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn directory_store_rejects_path_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());

        for name in ["..", "a/b", "a\\b", ""] {
            let owner = PlayerIdentity::from(name);
            assert_eq!(
                store.fetch_avatar(&owner, AvatarVersion(1)).await,
                Err(StoreError::NotFound)
            );
            assert_eq!(store.current_version(&owner).await, Ok(None));
        }
    }
}
