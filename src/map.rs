use std::{
    borrow::Borrow,
    collections::HashMap as StdHashMap,
    fmt,
    hash::{BuildHasher, Hash},
};

use crossbeam_utils::CachePadded;
use hashbrown::{hash_map::DefaultHashBuilder, HashMap};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use smallvec::SmallVec;

pub const MAX_SHARDS: usize = 2048;

#[derive(Debug, Clone)]
pub struct AtomicMapBuilder<S = DefaultHashBuilder> {
    hash_builder: S,
    shards: usize,
    capacity: Option<usize>,
}

impl<S: Default> Default for AtomicMapBuilder<S> {
    fn default() -> Self {
        let target = std::thread::available_parallelism()
            .map(|p| p.get() * 4)
            .unwrap_or(16);

        Self {
            hash_builder: Default::default(),
            shards: target_shards_to_exact(target),
            capacity: None,
        }
    }
}

impl AtomicMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S> AtomicMapBuilder<S> {
    pub fn hasher<S2>(self, hasher: S2) -> AtomicMapBuilder<S2> {
        AtomicMapBuilder {
            hash_builder: hasher,
            shards: self.shards,
            capacity: self.capacity,
        }
    }

    /// Rounds `shards` up to the next power of two, capped at [`MAX_SHARDS`].
    pub fn shards(self, shards: usize) -> Self {
        self.exact_shards(target_shards_to_exact(shards))
    }

    pub fn exact_shards(self, shards: usize) -> Self {
        assert!((1..=MAX_SHARDS).contains(&shards));
        assert!(shards.is_power_of_two());
        Self { shards, ..self }
    }

    /// Initial capacity of the whole map, spread evenly across shards.
    pub fn capacity(self, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..self
        }
    }

    pub fn build<K, V>(self) -> AtomicMap<K, V, S>
    where
        S: Clone,
    {
        let capacity_per_shard = self.capacity.unwrap_or(0).div_ceil(self.shards);

        let shards = std::iter::repeat_with(|| {
            CachePadded::new(RwLock::new(HashMap::with_capacity_and_hasher(
                capacity_per_shard,
                self.hash_builder.clone(),
            )))
        })
        .take(self.shards)
        .collect();

        AtomicMap {
            shards,
            hash_builder: self.hash_builder,
            mask: self.shards - 1,
        }
    }
}

fn target_shards_to_exact(target: usize) -> usize {
    target
        .checked_next_power_of_two()
        .unwrap_or(usize::MAX)
        .min(MAX_SHARDS)
        .max(1)
}

/// A hash map that can be shared between threads without external locking.
///
/// Keys are spread over a fixed set of independently locked shards. Every
/// single-key operation takes exactly one shard lock, so it is atomic with
/// respect to every other operation on that key. Whole-map operations
/// ([`size`](Self::size), [`snapshot`](Self::snapshot), [`clear`](Self::clear)
/// and everything built on them) take all shard locks in index order and so
/// observe or replace the map at a single instant.
///
/// Values are handed out by clone; store `Arc`s for anything expensive.
pub struct AtomicMap<K, V, S = DefaultHashBuilder> {
    shards: Box<[CachePadded<RwLock<HashMap<K, V, S>>>]>,
    hash_builder: S,
    mask: usize,
}

type Shards<G> = SmallVec<[G; 64]>;

impl<K, V> AtomicMap<K, V> {
    pub fn new() -> Self {
        AtomicMapBuilder::new().build()
    }
}

impl<K, V, S: Default + Clone> Default for AtomicMap<K, V, S> {
    fn default() -> Self {
        AtomicMapBuilder::default().build()
    }
}

impl<K, V, S> AtomicMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    pub fn load<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        self.shard(key).read().get(key).cloned()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.shard(key).read().contains_key(key)
    }

    pub fn store(&self, key: K, value: V) {
        self.shard(&key).write().insert(key, value);
    }

    /// Returns the value already present for `key` and `true`, or stores
    /// `value` and returns it with `false`. Of any number of racing callers
    /// for one key, exactly one sees `false`.
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool)
    where
        V: Clone,
    {
        let mut shard = self.shard(&key).write();
        match shard.entry(key) {
            hashbrown::hash_map::Entry::Occupied(o) => (o.get().clone(), true),
            hashbrown::hash_map::Entry::Vacant(v) => (v.insert(value).clone(), false),
        }
    }

    pub fn load_and_delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.shard(key).write().remove(key)
    }

    pub fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.load_and_delete(key);
    }

    pub fn swap(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).write().insert(key, value)
    }

    /// Replaces the value for `key` with `new` only if it currently equals
    /// `old`. A missing key never matches.
    pub fn compare_and_swap<Q>(&self, key: &Q, old: &V, new: V) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: PartialEq,
    {
        let mut shard = self.shard(key).write();
        match shard.get_mut(key) {
            Some(current) if *current == *old => {
                *current = new;
                true
            }
            _ => false,
        }
    }

    pub fn compare_and_delete<Q>(&self, key: &Q, old: &V) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: PartialEq,
    {
        let mut shard = self.shard(key).write();
        if shard.get(key) == Some(old) {
            shard.remove(key);
            true
        } else {
            false
        }
    }

    /// Visits a snapshot of the map taken when the call starts. No lock is
    /// held while `visit` runs, so it may call back into the map; mutations it
    /// or anyone else makes are not seen by this walk. Stops when `visit`
    /// returns `false`.
    pub fn range(&self, mut visit: impl FnMut(&K, &V) -> bool)
    where
        K: Clone,
        V: Clone,
    {
        for (key, value) in self.snapshot() {
            if !visit(&key, &value) {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let shards = self.read_all();
        let mut pairs = Vec::with_capacity(shards.iter().map(|s| s.len()).sum());
        for shard in &shards {
            pairs.extend(shard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        pairs
    }

    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        let shards = self.read_all();
        let mut keys = Vec::with_capacity(shards.iter().map(|s| s.len()).sum());
        for shard in &shards {
            keys.extend(shard.keys().cloned());
        }
        keys
    }

    pub fn size(&self) -> usize {
        self.read_all().iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// New map, configured like this one, holding the pairs of a snapshot
    /// for which `keep` returns `true`.
    pub fn filter(&self, mut keep: impl FnMut(&K, &V) -> bool) -> Self
    where
        K: Clone,
        V: Clone,
        S: Clone,
    {
        let filtered = self.empty_like();
        for (key, value) in self.snapshot() {
            if keep(&key, &value) {
                filtered.store(key, value);
            }
        }
        filtered
    }

    pub fn to_map(&self) -> StdHashMap<K, V>
    where
        K: Clone,
        V: Clone,
    {
        self.snapshot().into_iter().collect()
    }

    /// Swaps every shard for an empty one in a single step. The old entries
    /// are dropped after the locks are released.
    pub fn clear(&self)
    where
        S: Clone,
    {
        let mut shards = self.write_all();
        let old: Shards<HashMap<K, V, S>> = shards
            .iter_mut()
            .map(|shard| {
                std::mem::replace(&mut **shard, HashMap::with_hasher(self.hash_builder.clone()))
            })
            .collect();
        drop(shards);
        drop(old);
    }

    fn empty_like(&self) -> Self
    where
        S: Clone,
    {
        AtomicMapBuilder::new()
            .hasher(self.hash_builder.clone())
            .exact_shards(self.shards.len())
            .build()
    }

    fn shard<Q>(&self, key: &Q) -> &RwLock<HashMap<K, V, S>>
    where
        Q: ?Sized + Hash,
    {
        let hash = self.hash_builder.hash_one(key);
        // rehash so shard selection does not reuse the bits the table indexes with
        let index = (self.hash_builder.hash_one(hash) as usize) & self.mask;
        &self.shards[index]
    }

    fn read_all(&self) -> Shards<RwLockReadGuard<'_, HashMap<K, V, S>>> {
        self.shards.iter().map(|shard| shard.read()).collect()
    }

    fn write_all(&self) -> Shards<RwLockWriteGuard<'_, HashMap<K, V, S>>> {
        self.shards.iter().map(|shard| shard.write()).collect()
    }
}

impl<K, V, S> fmt::Debug for AtomicMap<K, V, S>
where
    K: Hash + Eq + fmt::Debug,
    V: fmt::Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shards = self.read_all();
        f.debug_map()
            .entries(shards.iter().flat_map(|shard| shard.iter()))
            .finish()
    }
}

impl<K, V, S> Extend<(K, V)> for AtomicMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.store(key, value);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for AtomicMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default + Clone,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::default();
        map.extend(iter);
        map
    }
}

impl<K, V, S> From<StdHashMap<K, V>> for AtomicMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default + Clone,
{
    fn from(map: StdHashMap<K, V>) -> Self {
        map.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc, Barrier},
        thread,
    };

    use super::*;

    #[test]
    fn load_missing_and_present() {
        let map = AtomicMap::new();
        map.store("key1", 123);

        assert_eq!(map.load("key1"), Some(123));
        assert_eq!(map.load("key2"), None);

        map.store("", 0);
        assert_eq!(map.load(""), Some(0));
    }

    #[test]
    fn load_or_store_keeps_first() {
        let map = AtomicMap::new();
        assert_eq!(map.load_or_store(1, "a"), ("a", false));
        assert_eq!(map.load_or_store(1, "b"), ("a", true));
        assert_eq!(map.load(&1), Some("a"));
    }

    #[test]
    fn load_or_store_single_creator() {
        let map = Arc::new(AtomicMapBuilder::new().shards(4).build::<u32, usize>());
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let map = Arc::clone(&map);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    map.load_or_store(7, i)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let stored: Vec<_> = results.iter().filter(|(_, loaded)| !loaded).collect();
        assert_eq!(stored.len(), 1);
        let winner = stored[0].0;
        assert!(results.iter().all(|(v, _)| *v == winner));
    }

    #[test]
    fn load_and_delete_and_delete() {
        let map = AtomicMap::new();
        map.store("a".to_string(), 1);
        map.store("b".to_string(), 2);

        assert_eq!(map.load_and_delete("a"), Some(1));
        assert_eq!(map.load_and_delete("a"), None);

        map.delete("b");
        map.delete("missing");
        assert!(map.is_empty());
    }

    #[test]
    fn swap_returns_previous() {
        let map = AtomicMap::new();
        assert_eq!(map.swap(1, 10), None);
        assert_eq!(map.swap(1, 20), Some(10));
        assert_eq!(map.load(&1), Some(20));
    }

    #[test]
    fn compare_and_swap() {
        let map = AtomicMap::new();
        map.store(1, 10);

        assert!(!map.compare_and_swap(&1, &11, 30));
        assert_eq!(map.load(&1), Some(10));

        assert!(map.compare_and_swap(&1, &10, 30));
        assert_eq!(map.load(&1), Some(30));

        assert!(!map.compare_and_swap(&2, &0, 1));
        assert_eq!(map.load(&2), None);
    }

    #[test]
    fn compare_and_delete() {
        let map = AtomicMap::new();
        map.store(1, 10);

        assert!(!map.compare_and_delete(&1, &11));
        assert_eq!(map.load(&1), Some(10));

        assert!(map.compare_and_delete(&1, &10));
        assert_eq!(map.load(&1), None);
        assert!(!map.compare_and_delete(&1, &10));
    }

    #[test]
    fn range_stops_early() {
        let map: AtomicMap<u32, u32> = (0..10).map(|i| (i, i * 2)).collect();

        let mut seen = 0;
        map.range(|_, _| {
            seen += 1;
            seen < 3
        });
        assert_eq!(seen, 3);
    }

    #[test]
    fn range_visitor_can_reenter() {
        let map: AtomicMap<u32, u32> = (0..10).map(|i| (i, i)).collect();

        let mut visited = 0;
        map.range(|k, v| {
            map.store(k + 100, *v);
            map.delete(k);
            visited += 1;
            true
        });

        assert_eq!(visited, 10);
        assert_eq!(map.size(), 10);
        assert!(map.keys().iter().all(|k| *k >= 100));
    }

    #[test]
    fn range_ignores_concurrent_inserts() {
        let map: Arc<AtomicMap<u32, u32>> = Arc::new((0..5).map(|i| (i, i)).collect());
        let (started, on_started) = mpsc::channel();
        let (inserted, on_inserted) = mpsc::channel();

        let writer = {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                on_started.recv().unwrap();
                for i in 100..200 {
                    map.store(i, i);
                }
                inserted.send(()).unwrap();
            })
        };

        let mut seen = Vec::new();
        let mut first = true;
        map.range(|k, _| {
            if first {
                first = false;
                started.send(()).unwrap();
                on_inserted.recv().unwrap();
            }
            seen.push(*k);
            true
        });
        writer.join().unwrap();

        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(map.size(), 105);
    }

    #[test]
    fn from_std_map() {
        for input in [
            StdHashMap::new(),
            StdHashMap::from([(1, "one")]),
            StdHashMap::from([(1, "one"), (2, "two"), (3, "three")]),
        ] {
            let map: AtomicMap<_, _> = input.clone().into();
            assert_eq!(map.size(), input.len());
            for (k, v) in &input {
                assert_eq!(map.load(k), Some(*v));
            }
            assert_eq!(map.to_map(), input);
        }
    }

    #[test]
    fn filter_keeps_matching() {
        let map: AtomicMap<u32, u32> = (0..10).map(|i| (i, i)).collect();
        let even = map.filter(|k, _| k % 2 == 0);

        assert_eq!(even.size(), 5);
        assert!(even.keys().iter().all(|k| k % 2 == 0));
        assert_eq!(map.size(), 10);
    }

    #[test]
    fn filter_keeps_hasher_and_shards() {
        let map = AtomicMapBuilder::new()
            .hasher(std::collections::hash_map::RandomState::new())
            .exact_shards(4)
            .build::<u32, u32>();
        for i in 0..20 {
            map.store(i, i);
        }

        let small = map.filter(|_, v| *v < 5);
        assert_eq!(small.shards.len(), 4);
        assert_eq!(small.size(), 5);
        assert_eq!(small.load(&3), Some(3));
        assert_eq!(small.load(&7), None);
    }

    #[test]
    fn clear_empties_every_shard() {
        let map = AtomicMapBuilder::new().exact_shards(8).build();
        for i in 0..100 {
            map.store(i, ());
        }
        map.clear();
        assert!(map.is_empty());
        assert!(map.snapshot().is_empty());

        map.store(1, ());
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn builder_rounds_shards() {
        assert_eq!(target_shards_to_exact(0), 1);
        assert_eq!(target_shards_to_exact(3), 4);
        assert_eq!(target_shards_to_exact(usize::MAX), MAX_SHARDS);

        let map = AtomicMapBuilder::new().shards(5).capacity(100).build::<u8, u8>();
        assert_eq!(map.shards.len(), 8);
    }

    #[test]
    #[should_panic]
    fn exact_shards_rejects_non_power_of_two() {
        AtomicMapBuilder::new().exact_shards(3);
    }
}
