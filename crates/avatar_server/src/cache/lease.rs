use super::AvatarRecord;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Handle to a cached avatar.
///
/// While a pinned lease is alive the cache entry cannot be evicted, which
/// keeps avatars resident for the duration of an in-flight send.
pub struct AvatarLease {
    record: Arc<AvatarRecord>,
    pin: Option<Arc<AtomicUsize>>,
}

impl AvatarLease {
    pub(super) fn pinned(record: Arc<AvatarRecord>, pin: Arc<AtomicUsize>) -> Self {
        pin.fetch_add(1, Ordering::AcqRel);
        Self {
            record,
            pin: Some(pin),
        }
    }

    /// A lease on a record that is no longer resident.
    pub(crate) fn detached(record: Arc<AvatarRecord>) -> Self {
        Self { record, pin: None }
    }

    pub fn is_pinned(&self) -> bool {
        self.pin.is_some()
    }
}

impl Deref for AvatarLease {
    type Target = AvatarRecord;

    fn deref(&self) -> &AvatarRecord {
        &self.record
    }
}

impl Clone for AvatarLease {
    fn clone(&self) -> Self {
        match &self.pin {
            Some(pin) => Self::pinned(Arc::clone(&self.record), Arc::clone(pin)),
            None => Self::detached(Arc::clone(&self.record)),
        }
    }
}

impl Drop for AvatarLease {
    fn drop(&mut self) {
        if let Some(pin) = &self.pin {
            pin.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for AvatarLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvatarLease")
            .field("key", &self.record.key)
            .field("size", &self.record.size())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}
