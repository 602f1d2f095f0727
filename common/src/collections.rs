//! Hash collections seeded from the process RNG, and `AddressBook`, the
//! generic "set of peers we can sample from" structure used throughout the
//! core wherever §4.3 describes picking a peer (a loader candidate, a
//! request-batching target, a rebroadcast target).
use std::collections::{HashMap as StdHashMap, HashSet as StdHashSet};
use std::hash::BuildHasher;

use siphasher::sip::SipHasher13;

/// A `BuildHasher` seeded from an `fastrand::Rng`, so that hash-based
/// collections keyed by externally-controlled data (a peer's announced
/// address, an inventory hash) don't have a predictable ordering an
/// adversary could exploit to target hash-collision behavior.
#[derive(Clone)]
pub struct RandomState(u64, u64);

impl RandomState {
    /// Derive a new seed from the given RNG.
    pub fn new(rng: &fastrand::Rng) -> Self {
        Self(rng.u64(..), rng.u64(..))
    }
}

impl BuildHasher for RandomState {
    type Hasher = SipHasher13;

    fn build_hasher(&self) -> Self::Hasher {
        SipHasher13::new_with_keys(self.0, self.1)
    }
}

impl From<fastrand::Rng> for RandomState {
    fn from(rng: fastrand::Rng) -> Self {
        Self::new(&rng)
    }
}

/// A hash map keyed with a process-seeded hasher.
pub type HashMap<K, V> = StdHashMap<K, V, RandomState>;
/// A hash set keyed with a process-seeded hasher.
pub type HashSet<T> = StdHashSet<T, RandomState>;

/// A collection of peers that supports uniform random sampling, used
/// wherever the core needs to pick a peer to make a request of (a loader
/// candidate, a batching target for `getdata`, a rebroadcast target).
#[derive(Debug, Clone)]
pub struct AddressBook<K, V> {
    book: StdHashMap<K, V, RandomState>,
    rng: fastrand::Rng,
}

impl<K: Eq + std::hash::Hash, V> AddressBook<K, V> {
    /// Create a new, empty address book.
    pub fn new(rng: fastrand::Rng) -> Self {
        let hasher = RandomState::new(&rng);
        Self {
            book: StdHashMap::with_hasher(hasher),
            rng,
        }
    }

    /// Insert an entry, returning the previous value if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.book.insert(key, value)
    }

    /// Remove an entry.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.book.remove(key)
    }

    /// Look up an entry.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.book.get(key)
    }

    /// Look up an entry, mutably.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.book.get_mut(key)
    }

    /// Whether a key is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.book.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.book.len()
    }

    /// Whether the book is empty.
    pub fn is_empty(&self) -> bool {
        self.book.is_empty()
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.book.iter()
    }

    /// Iterate over all entries, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.book.iter_mut()
    }

    /// Iterate over the keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.book.keys()
    }

    /// Pick a uniformly random entry, or `None` if the book is empty.
    pub fn sample(&self) -> Option<(&K, &V)> {
        self.sample_with(|_, _| true)
    }

    /// Pick a uniformly random entry matching `predicate`, or `None` if
    /// none match.
    pub fn sample_with(&self, predicate: impl Fn(&K, &V) -> bool) -> Option<(&K, &V)> {
        let candidates: Vec<_> = self.book.iter().filter(|(k, v)| predicate(k, v)).collect();

        if candidates.is_empty() {
            return None;
        }
        let ix = self.rng.usize(..candidates.len());
        candidates.into_iter().nth(ix)
    }
}

impl<K: Eq + std::hash::Hash, V> Default for AddressBook<K, V> {
    fn default() -> Self {
        Self::new(fastrand::Rng::new())
    }
}

impl<K: Eq + std::hash::Hash, V> FromIterator<(K, V)> for AddressBook<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut book = Self::default();
        for (k, v) in iter {
            book.insert(k, v);
        }
        book
    }
}
