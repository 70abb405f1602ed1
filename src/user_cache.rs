//! Bounded user cache
//!
//! LRU-bounded map from user id to the role fields the admin check needs,
//! saving a database round-trip on repeated admin-gated calls. Entries have
//! no TTL; they leave on capacity pressure or explicitly on logout.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// Role fields cached per user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedUser {
    /// Login name
    pub username: String,
    /// Display name
    pub realname: String,
    /// Role code; see [`crate::users::ROLE_ADMIN`]
    pub role: i8,
}

/// Bounded LRU over [`CachedUser`] entries
pub struct UserCache {
    entries: Mutex<LruCache<u64, CachedUser>>,
}

impl UserCache {
    /// Create a cache holding at most `capacity` entries (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetch an entry, marking it most recently used
    #[must_use]
    pub fn get(&self, user_id: u64) -> Option<CachedUser> {
        self.entries.lock().get(&user_id).cloned()
    }

    /// Insert an entry, evicting the least recently used one if over capacity
    pub fn put(&self, user_id: u64, entry: CachedUser) {
        self.entries.lock().put(user_id, entry);
    }

    /// Drop an entry, e.g. on logout
    pub fn remove(&self, user_id: u64) {
        self.entries.lock().pop(&user_id);
    }

    /// Current number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
