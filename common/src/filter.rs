//! Non-cryptographic approximate-membership filters.
//!
//! §3 and §9 ("Bloom-style filter") ask for a space-efficient probabilistic
//! set with configurable capacity and false-positive rate, used per-peer to
//! dedupe addresses and inventory already sent (`addr_filter`,
//! `inv_filter`). This is unrelated to the BIP37 wire filter a peer can
//! load onto us — it never leaves the process and has no wire format.
use std::hash::{Hash, Hasher};

use siphasher::sip::SipHasher13;

const LN2_SQUARED: f64 = std::f64::consts::LN_2 * std::f64::consts::LN_2;

/// A fixed-size approximate set.
#[derive(Debug, Clone)]
pub struct ApproximateSet {
    bits: Vec<u64>,
    m: u64,
    seeds: Vec<(u64, u64)>,
}

impl ApproximateSet {
    /// Construct a filter sized for `capacity` elements at the given
    /// false-positive rate.
    pub fn new(capacity: usize, false_positive_rate: f64, rng: &fastrand::Rng) -> Self {
        let capacity = capacity.max(1) as f64;
        let m = (-1.0 * capacity * false_positive_rate.ln() / LN2_SQUARED)
            .ceil()
            .max(8.0) as u64;
        let k = ((m as f64 / capacity) * std::f64::consts::LN_2)
            .round()
            .clamp(1.0, 50.0) as usize;
        let words = (m as usize + 63) / 64;
        let seeds = (0..k).map(|_| (rng.u64(..), rng.u64(..))).collect();

        Self {
            bits: vec![0u64; words],
            m,
            seeds,
        }
    }

    fn indices<T: Hash>(&self, item: &T) -> Vec<u64> {
        self.seeds
            .iter()
            .map(|&(k0, k1)| {
                let mut hasher = SipHasher13::new_with_keys(k0, k1);
                item.hash(&mut hasher);
                hasher.finish() % self.m
            })
            .collect()
    }

    /// Insert an item into the set.
    pub fn insert<T: Hash>(&mut self, item: &T) {
        for index in self.indices(item) {
            self.bits[(index / 64) as usize] |= 1 << (index % 64);
        }
    }

    /// Test whether an item is (probably) already in the set.
    pub fn contains<T: Hash>(&self, item: &T) -> bool {
        self.indices(item)
            .into_iter()
            .all(|index| self.bits[(index / 64) as usize] & (1 << (index % 64)) != 0)
    }

    /// Insert an item, returning whether it was already present.
    pub fn insert_new<T: Hash>(&mut self, item: &T) -> bool {
        if self.contains(item) {
            return false;
        }
        self.insert(item);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_items_are_found() {
        let rng = fastrand::Rng::with_seed(1);
        let mut filter = ApproximateSet::new(5000, 0.001, &rng);

        for i in 0u32..1000 {
            filter.insert(&i);
        }
        for i in 0u32..1000 {
            assert!(filter.contains(&i));
        }
    }

    #[test]
    fn insert_new_is_false_on_second_call() {
        let rng = fastrand::Rng::with_seed(2);
        let mut filter = ApproximateSet::new(100, 0.001, &rng);

        assert!(filter.insert_new(&"hello"));
        assert!(!filter.insert_new(&"hello"));
    }

    #[test]
    fn false_positive_rate_is_reasonable() {
        let rng = fastrand::Rng::with_seed(3);
        let mut filter = ApproximateSet::new(1000, 0.01, &rng);

        for i in 0u32..1000 {
            filter.insert(&i);
        }
        let false_positives = (1000u32..11000).filter(|i| filter.contains(i)).count();
        // Allow generous slack: this is a statistical property, not exact.
        assert!(false_positives < 500, "false positives: {false_positives}");
    }
}
