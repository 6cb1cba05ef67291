use std::{
    borrow::Borrow,
    fmt,
    future::Future,
    hash::{BuildHasher, Hash},
    ops::Deref,
    sync::Arc,
};

use hashbrown::hash_map::DefaultHashBuilder;

use crate::{
    map::{AtomicMap, AtomicMapBuilder},
    once::OnceGuard,
    Error,
};

type Cell<V, E> = OnceGuard<Result<V, E>>;

#[derive(Debug, Clone)]
pub struct MemoCacheBuilder<S = DefaultHashBuilder> {
    map: AtomicMapBuilder<S>,
}

impl<S: Default> Default for MemoCacheBuilder<S> {
    fn default() -> Self {
        Self {
            map: Default::default(),
        }
    }
}

impl MemoCacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S> MemoCacheBuilder<S> {
    pub fn hasher<S2>(self, hasher: S2) -> MemoCacheBuilder<S2> {
        MemoCacheBuilder {
            map: self.map.hasher(hasher),
        }
    }

    pub fn shards(self, shards: usize) -> Self {
        Self {
            map: self.map.shards(shards),
        }
    }

    pub fn exact_shards(self, shards: usize) -> Self {
        Self {
            map: self.map.exact_shards(shards),
        }
    }

    pub fn capacity(self, capacity: usize) -> Self {
        Self {
            map: self.map.capacity(capacity),
        }
    }

    pub fn build<K, V, E>(self) -> MemoCache<K, V, E, S>
    where
        S: Clone,
    {
        MemoCache {
            cells: self.map.build(),
        }
    }
}

/// Memoizes the result of a loader per key.
///
/// However many threads or tasks ask for the same key at once, exactly one
/// loader runs; everybody else waits for it and receives the same result.
/// Errors are memoized like values: a key whose loader failed keeps returning
/// that error until it is [evicted](Self::evict). The same holds for a load
/// that never finished: if the loader panics, or the future running it is
/// dropped, the key answers [`Error::LoaderPanicked`] or
/// [`Error::LoadCancelled`] until it is evicted. No second loader runs.
///
/// Evicting or clearing only detaches entries from the cache. A load that is
/// already running keeps going and delivers its result to the callers that
/// were waiting on it; the next lookup of the key starts a fresh load.
pub struct MemoCache<K, V, E, S = DefaultHashBuilder> {
    cells: AtomicMap<K, Arc<Cell<V, E>>, S>,
}

impl<K, V, E> MemoCache<K, V, E> {
    pub fn new() -> Self {
        MemoCacheBuilder::new().build()
    }
}

impl<K, V, E, S: Default + Clone> Default for MemoCache<K, V, E, S> {
    fn default() -> Self {
        MemoCacheBuilder::default().build()
    }
}

impl<K, V, E, S> MemoCache<K, V, E, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    /// Returns the memoized result for `key`, running `loader` if no result
    /// exists yet and no other caller is already producing one.
    ///
    /// A panic in `loader` unwinds through this call; every other caller for
    /// the key gets [`Error::LoaderPanicked`].
    pub fn get_or_load<F>(&self, key: K, loader: F) -> crate::Result<Memoized<V, E>>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        let cell = self.cell(&key);
        cell.get_or_init(|| {
            tracing::debug!("running loader");
            let result = loader(&key);
            tracing::debug!(failed = result.is_err(), "loader finished");
            result
        })?;
        Ok(Memoized(cell))
    }

    /// Like [`get_or_load`](Self::get_or_load) for callers whose loader is
    /// optional. A missing loader is rejected before the cache is touched, so
    /// it never leaves anything behind for `key`.
    pub fn try_get_or_load<F>(&self, key: K, loader: Option<F>) -> crate::Result<Memoized<V, E>>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        let loader = loader.ok_or(Error::MissingLoader)?;
        self.get_or_load(key, loader)
    }

    pub fn get_or_load_cloned<F>(&self, key: K, loader: F) -> crate::Result<Result<V, E>>
    where
        F: FnOnce(&K) -> Result<V, E>,
        V: Clone,
        E: Clone,
    {
        Ok((*self.get_or_load(key, loader)?).clone())
    }

    /// Async flavour of [`get_or_load`](Self::get_or_load). Waiting tasks do
    /// not block their thread, and they share the key with blocking callers.
    ///
    /// Dropping the future of the task that is running the loader abandons
    /// that load for good: its waiters, and every later lookup until the key
    /// is evicted, get [`Error::LoadCancelled`].
    pub async fn get_or_load_async<F, Fut>(
        &self,
        key: K,
        loader: F,
    ) -> crate::Result<Memoized<V, E>>
    where
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self.cell(&key);
        cell.get_or_init_async(|| {
            tracing::debug!("running async loader");
            loader(&key)
        })
        .await?;
        Ok(Memoized(cell))
    }

    /// Returns the result for `key` if one has been produced. Keys whose load
    /// is still in flight, or was abandoned, read as missing.
    pub fn get<Q>(&self, key: &Q) -> Option<Memoized<V, E>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.cells
            .load(key)
            .filter(|cell| matches!(cell.get(), Some(Ok(_))))
            .map(Memoized)
    }

    /// Forgets `key`, returning whether it was present.
    pub fn evict<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let evicted = self.cells.load_and_delete(key).is_some();
        tracing::debug!(evicted, "evict");
        evicted
    }

    pub fn clear(&self)
    where
        S: Clone,
    {
        self.cells.clear();
        tracing::debug!("cleared");
    }

    pub fn keys(&self) -> Vec<K> {
        self.cells.keys()
    }

    pub fn len(&self) -> usize {
        self.cells.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, key: &K) -> Arc<Cell<V, E>> {
        if let Some(cell) = self.cells.load(key) {
            tracing::trace!("cache hit");
            return cell;
        }

        let (cell, loaded) = self.cells.load_or_store(key.clone(), Arc::default());
        if !loaded {
            tracing::trace!("created cell");
        }
        cell
    }
}

impl<K, V, E, S> fmt::Debug for MemoCache<K, V, E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoCache").finish_non_exhaustive()
    }
}

/// Shared handle to a memoized result.
///
/// Keeps the result alive even after its key has been evicted.
pub struct Memoized<V, E>(Arc<Cell<V, E>>);

impl<V, E> Memoized<V, E> {
    pub fn value(&self) -> Option<&V> {
        (**self).as_ref().ok()
    }

    pub fn error(&self) -> Option<&E> {
        (**self).as_ref().err()
    }

    /// Whether both handles point at the result of the same load.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.0, &other.0)
    }
}

impl<V, E> Clone for Memoized<V, E> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<V, E> Deref for Memoized<V, E> {
    type Target = Result<V, E>;

    fn deref(&self) -> &Self::Target {
        match self.0.get() {
            Some(Ok(result)) => result,
            _ => unreachable!("memoized handle to an unfinished load"),
        }
    }
}

impl<V: fmt::Debug, E: fmt::Debug> fmt::Debug for Memoized<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Memoized").field(&**self).finish()
    }
}
