//! Tiered collection: priority → set of items.
//!
//! Tier sets live in a `DashMap`, so a mutation holds only its tier's shard
//! lock. Every read returns a copy.

use std::collections::HashSet;
use std::hash::Hash;

use dashmap::DashMap;

use tproute_common::types::Priority;

pub struct PriorityCollection<T> {
    tiers: DashMap<Priority, HashSet<T>>,
}

impl<T> PriorityCollection<T>
where
    T: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            tiers: DashMap::new(),
        }
    }

    pub fn add(&self, priority: Priority, item: T) {
        self.tiers.entry(priority).or_default().insert(item);
    }

    /// Add every item to `priority`. A tier that ends up empty is dropped.
    pub fn add_all<I>(&self, priority: Priority, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut tier = self.tiers.entry(priority).or_default();
        tier.extend(items);
        let empty = tier.is_empty();
        drop(tier);
        if empty {
            self.tiers.remove_if(&priority, |_, set| set.is_empty());
        }
    }

    /// Snapshot of one tier; empty when the tier does not exist.
    pub fn get(&self, priority: Priority) -> Vec<T> {
        self.tiers
            .get(&priority)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tier keys, lowest first.
    pub fn priorities(&self) -> Vec<Priority> {
        let mut keys: Vec<Priority> = self.tiers.iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        keys
    }

    /// Remove `item` from every tier, dropping tiers left empty.
    pub fn remove(&self, item: &T) {
        for priority in self.priorities() {
            if let Some(mut tier) = self.tiers.get_mut(&priority) {
                tier.remove(item);
            }
            self.tiers.remove_if(&priority, |_, set| set.is_empty());
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.tiers.iter().any(|tier| tier.value().contains(item))
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(|tier| tier.value().is_empty())
    }
}

impl<T> Default for PriorityCollection<T>
where
    T: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for PriorityCollection<T>
where
    T: Clone + Eq + Hash + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for priority in self.priorities() {
            map.entry(&priority, &self.get(priority));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_and_get() {
        let c = PriorityCollection::new();
        c.add(1, "a");
        c.add(1, "b");
        c.add(0, "c");
        let mut tier = c.get(1);
        tier.sort();
        assert_eq!(tier, vec!["a", "b"]);
        assert_eq!(c.get(0), vec!["c"]);
        assert!(c.get(7).is_empty());
    }

    #[test]
    fn test_priorities_ascending() {
        let c = PriorityCollection::new();
        c.add(5, 1u32);
        c.add(0, 2);
        c.add(2, 3);
        assert_eq!(c.priorities(), vec![0, 2, 5]);
    }

    #[test]
    fn test_add_all_empty_drops_tier() {
        let c: PriorityCollection<u32> = PriorityCollection::new();
        c.add_all(3, Vec::new());
        assert!(c.priorities().is_empty());
        c.add_all(3, vec![1, 2]);
        assert_eq!(c.get(3).len(), 2);
    }

    #[test]
    fn test_remove_from_every_tier() {
        let c = PriorityCollection::new();
        c.add(0, "a");
        c.add(1, "a");
        c.add(1, "b");
        c.remove(&"a");
        assert_eq!(c.priorities(), vec![1]);
        assert_eq!(c.get(1), vec!["b"]);
        assert!(!c.contains(&"a"));
        c.remove(&"b");
        assert!(c.is_empty());
    }

    #[test]
    fn test_concurrent_adds_are_not_lost() {
        let c = Arc::new(PriorityCollection::new());
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let c = c.clone();
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        c.add(u64::from(i % 3), t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let total: usize = c.priorities().iter().map(|p| c.get(*p).len()).sum();
        assert_eq!(total, 800);
    }

    #[test]
    fn test_reads_tolerate_concurrent_removal() {
        let c = Arc::new(PriorityCollection::new());
        for i in 0..50u32 {
            c.add(u64::from(i % 5), i);
        }
        let remover = {
            let c = c.clone();
            std::thread::spawn(move || {
                for i in 0..50u32 {
                    c.remove(&i);
                }
            })
        };
        for _ in 0..50 {
            for p in c.priorities() {
                let _ = c.get(p);
            }
        }
        remover.join().unwrap();
        assert!(c.is_empty());
    }
}
