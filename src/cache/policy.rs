//! Cache Eviction Policies
//!
//! The two eviction rules of the cache, kept as plain data structures and
//! functions so they can be tested without any I/O:
//!
//! - memory tier: least-recently-used, where both `get` and `put` count as a use
//! - disk tier: oldest-by-write-time, pruned until the byte budget fits

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

/// Access-ordered index of keys
///
/// Each use stamps the key with a fresh, strictly increasing tick. The key
/// holding the smallest tick is the least recently used.
#[derive(Debug)]
pub struct AccessOrder<K> {
    ticks: BTreeMap<u64, K>,
    next_tick: u64,
}

impl<K: Clone> AccessOrder<K> {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            ticks: BTreeMap::new(),
            next_tick: 0,
        }
    }

    /// Record a use of `key`, dropping its previous stamp if any
    ///
    /// Returns the new tick, which the caller stores next to the value.
    pub fn touch(&mut self, key: &K, previous: Option<u64>) -> u64 {
        if let Some(tick) = previous {
            self.ticks.remove(&tick);
        }
        let tick = self.next_tick;
        self.next_tick += 1;
        self.ticks.insert(tick, key.clone());
        tick
    }

    /// Forget a stamp (entry removed)
    pub fn forget(&mut self, tick: u64) {
        self.ticks.remove(&tick);
    }

    /// The least recently used key
    pub fn least_recent(&self) -> Option<(u64, &K)> {
        self.ticks.iter().next().map(|(tick, key)| (*tick, key))
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    /// True when nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Drop every stamp
    pub fn clear(&mut self) {
        self.ticks.clear();
    }
}

impl<K: Clone> Default for AccessOrder<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Choose the LRU victim once `len` exceeds `max_entries`
pub fn lru_victim<K: Clone>(order: &AccessOrder<K>, len: usize, max_entries: usize) -> Option<K> {
    if len <= max_entries {
        return None;
    }
    order.least_recent().map(|(_, key)| key.clone())
}

/// A cache file considered for pruning
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Path of the file
    pub path: PathBuf,
    /// Size in bytes
    pub len: u64,
    /// Last-modified time (write time)
    pub modified: SystemTime,
}

/// Select the files to delete so the total size fits `budget`
///
/// Files go oldest-written first. The newest file only goes when it alone is
/// larger than the budget.
pub fn prune_plan(mut files: Vec<FileStat>, budget: u64) -> Vec<PathBuf> {
    let mut total: u64 = files.iter().map(|f| f.len).sum();
    if total <= budget {
        return Vec::new();
    }

    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

    let mut victims = Vec::new();
    for file in files {
        if total <= budget {
            break;
        }
        total = total.saturating_sub(file.len);
        victims.push(file.path);
    }
    victims
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn stat(name: &str, len: u64, age_secs: u64) -> FileStat {
        FileStat {
            path: PathBuf::from(name),
            len,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 - age_secs),
        }
    }

    #[test]
    fn test_access_order_least_recent() {
        let mut order = AccessOrder::new();
        let a = order.touch(&"a", None);
        let _b = order.touch(&"b", None);
        let _c = order.touch(&"c", None);

        assert_eq!(order.least_recent().map(|(_, k)| *k), Some("a"));

        // Using "a" again moves it to the back
        order.touch(&"a", Some(a));
        assert_eq!(order.least_recent().map(|(_, k)| *k), Some("b"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_lru_victim_only_when_over_capacity() {
        let mut order = AccessOrder::new();
        order.touch(&1, None);
        order.touch(&2, None);

        assert_eq!(lru_victim(&order, 2, 2), None);
        assert_eq!(lru_victim(&order, 3, 2), Some(1));
    }

    #[test]
    fn test_forget_removes_stamp() {
        let mut order = AccessOrder::new();
        let t = order.touch(&"x", None);
        order.forget(t);
        assert!(order.is_empty());
        assert!(order.least_recent().is_none());
    }

    #[test]
    fn test_prune_plan_under_budget() {
        let files = vec![stat("a", 10, 3), stat("b", 10, 2)];
        assert!(prune_plan(files, 20).is_empty());
    }

    #[test]
    fn test_prune_plan_oldest_first() {
        let files = vec![
            stat("newest", 40, 1),
            stat("oldest", 40, 30),
            stat("middle", 40, 10),
        ];

        let victims = prune_plan(files, 90);
        assert_eq!(victims, vec![PathBuf::from("oldest")]);
    }

    #[test]
    fn test_prune_plan_keeps_newest_when_it_fits() {
        let files = vec![stat("old", 60, 5), stat("new", 60, 1)];
        let victims = prune_plan(files, 100);
        assert_eq!(victims, vec![PathBuf::from("old")]);
    }

    #[test]
    fn test_prune_plan_drops_newest_when_oversized() {
        let files = vec![stat("old", 10, 5), stat("huge", 500, 1)];
        let victims = prune_plan(files, 100);
        assert_eq!(victims, vec![PathBuf::from("old"), PathBuf::from("huge")]);
    }

    proptest! {
        #[test]
        fn prop_prune_plan_fits_budget(
            sizes in proptest::collection::vec(1u64..500, 1..40),
            budget in 0u64..5_000,
        ) {
            let files: Vec<FileStat> = sizes
                .iter()
                .enumerate()
                .map(|(i, len)| stat(&format!("f{i:03}"), *len, (sizes.len() - i) as u64))
                .collect();
            let total: u64 = sizes.iter().sum();
            let newest = format!("f{:03}", sizes.len() - 1);
            let newest_len = *sizes.last().unwrap();

            let victims = prune_plan(files, budget);
            let freed: u64 = victims
                .iter()
                .map(|p| {
                    let idx: usize = p.to_string_lossy()[1..].parse().unwrap();
                    sizes[idx]
                })
                .sum();

            prop_assert!(total - freed <= budget);
            if newest_len <= budget {
                prop_assert!(!victims.contains(&PathBuf::from(newest)));
            }
        }

        #[test]
        fn prop_lru_victim_is_oldest_touch(keys in proptest::collection::vec(0u8..16, 1..64)) {
            let mut order = AccessOrder::new();
            let mut stamps = std::collections::HashMap::new();
            for k in &keys {
                let prev = stamps.get(k).copied();
                let t = order.touch(k, prev);
                stamps.insert(*k, t);
            }

            // The victim is the distinct key whose last use came first
            let victim = order.least_recent().map(|(_, k)| *k).unwrap();
            let expected = stamps.iter().min_by_key(|(_, t)| **t).map(|(k, _)| *k).unwrap();
            prop_assert_eq!(victim, expected);
            prop_assert_eq!(order.len(), stamps.len());
        }
    }
}
