//! Entity arena and guarded side tables.
//!
//! Every live session and transfer is an [`EntityId`] handed out by a
//! monotonically increasing counter. Components (session record, client
//! record, transfer record) live in [`Table`]s keyed by that id.
//!
//! A [`Table`] never lends out an iterator or a guard. Reads and mutations go
//! through closures that run while the shard lock is held, and iteration only
//! ever returns a snapshot of keys, so removal and notification always happen
//! after the lock is gone.

use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Index of an entity in the router's arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    /// Wrap a raw index.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw index.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

/// What an entity is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A connected session, and its client once joined.
    Session,
    /// A relayed transfer.
    Transfer,
}

/// Hands out entity ids and remembers which are alive.
#[derive(Debug, Default)]
pub struct Arena {
    next: AtomicU64,
    live: Table<EntityId, EntityKind>,
}

impl Arena {
    /// Empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new entity of `kind`.
    pub fn spawn(&self, kind: EntityKind) -> EntityId {
        let id = EntityId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.live.insert(id, kind);
        id
    }

    /// Forget `id`. Returns its kind if it was alive.
    pub fn despawn(&self, id: EntityId) -> Option<EntityKind> {
        self.live.remove(&id)
    }

    /// Kind of `id`, if alive.
    pub fn kind(&self, id: EntityId) -> Option<EntityKind> {
        self.live.get_cloned(&id)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// No live entities.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// A concurrent map reachable only through scoped closures.
pub struct Table<K, V> {
    inner: DashMap<K, V>,
}

impl<K: Eq + Hash, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V> fmt::Debug for Table<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table").field("len", &self.inner.len()).finish()
    }
}

impl<K: Eq + Hash + Clone, V> Table<K, V> {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, returning the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    /// Remove and return the value for `key`.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    /// Remove `key` only if `predicate` holds for its value, atomically.
    pub fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        self.inner
            .remove_if(key, |_, v| predicate(v))
            .map(|(_, v)| v)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// No entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Run `f` against the value for `key`.
    pub fn with<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.inner.get(key).map(|v| f(v.value()))
    }

    /// Run `f` against the value for `key`, mutably.
    pub fn with_mut<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.inner.get_mut(key).map(|mut v| f(v.value_mut()))
    }

    /// Run `f` against the value for `key`, inserting `init()` first if
    /// absent. The flag is true when the entry was created.
    pub fn upsert<R>(
        &self,
        key: K,
        init: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> (bool, R) {
        let mut created = false;
        let mut entry = self.inner.entry(key).or_insert_with(|| {
            created = true;
            init()
        });
        (created, f(entry.value_mut()))
    }

    /// Keys whose entry satisfies `predicate`, snapshotted shard by shard.
    pub fn select(&self, mut predicate: impl FnMut(&K, &V) -> bool) -> Vec<K> {
        self.inner
            .iter()
            .filter(|entry| predicate(entry.key(), entry.value()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Run `f` against every value, one shard lock at a time.
    pub fn for_each_mut(&self, mut f: impl FnMut(&K, &mut V)) {
        for mut entry in self.inner.iter_mut() {
            let (key, value) = entry.pair_mut();
            f(key, value);
        }
    }

    /// Snapshot of every key.
    pub fn keys(&self) -> Vec<K> {
        self.select(|_, _| true)
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Table<K, V> {
    /// Copy of the value for `key`.
    pub fn get_cloned(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|v| v.value().clone())
    }
}
