//! Store filter pipeline.
//!
//! Each filter is a predicate pair over a store: one predicate rejects it as
//! a balance source, the other as a balance target. A pipeline is an ordered
//! list of filters consulted in registration order; the first rejection
//! wins.

use crate::cluster::Store;

/// A store suitability predicate pair. Returning `true` rejects the store.
pub trait Filter: Send + Sync {
    /// Reject `store` as a store to move a replica away from.
    fn filter_source(&self, store: &Store) -> bool;

    /// Reject `store` as a store to move a replica onto.
    fn filter_target(&self, store: &Store) -> bool;
}

/// Rejects stores outside the admissible occupancy band.
///
/// A store with no reported capacity is rejected in both directions.
pub struct CapacityFilter {
    min_used_ratio: f64,
    max_used_ratio: f64,
}

impl CapacityFilter {
    pub fn new(min_used_ratio: f64, max_used_ratio: f64) -> Self {
        Self {
            min_used_ratio,
            max_used_ratio,
        }
    }
}

impl Filter for CapacityFilter {
    fn filter_source(&self, store: &Store) -> bool {
        if store.stats.capacity == 0 {
            return true;
        }
        // Nothing worth draining below the lower bound.
        store.used_ratio() <= self.min_used_ratio
    }

    fn filter_target(&self, store: &Store) -> bool {
        if store.stats.capacity == 0 {
            return true;
        }
        // No room above the upper bound.
        store.used_ratio() >= self.max_used_ratio
    }
}

/// Rejects stores already at their concurrent snapshot caps.
pub struct SnapCountFilter {
    max_sending_snap_count: u32,
    max_receiving_snap_count: u32,
}

impl SnapCountFilter {
    pub fn new(max_sending_snap_count: u32, max_receiving_snap_count: u32) -> Self {
        Self {
            max_sending_snap_count,
            max_receiving_snap_count,
        }
    }
}

impl Filter for SnapCountFilter {
    fn filter_source(&self, store: &Store) -> bool {
        store.stats.sending_snap_count >= self.max_sending_snap_count
    }

    fn filter_target(&self, store: &Store) -> bool {
        store.stats.receiving_snap_count >= self.max_receiving_snap_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StoreStats;

    fn make_store(capacity: u64, available: u64) -> Store {
        Store {
            id: 1,
            stats: StoreStats {
                capacity,
                available,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_capacity_filter_source() {
        let filter = CapacityFilter::new(0.4, 0.9);

        // 30% used: nothing to drain.
        assert!(filter.filter_source(&make_store(100, 70)));
        // 50% used: admissible source.
        assert!(!filter.filter_source(&make_store(100, 50)));
        // Exactly at the lower bound is still rejected.
        assert!(filter.filter_source(&make_store(100, 60)));
    }

    #[test]
    fn test_capacity_filter_target() {
        let filter = CapacityFilter::new(0.4, 0.9);

        // 95% used: no room.
        assert!(filter.filter_target(&make_store(100, 5)));
        // Exactly at the upper bound is rejected.
        assert!(filter.filter_target(&make_store(100, 10)));
        // 50% used: admissible target.
        assert!(!filter.filter_target(&make_store(100, 50)));
    }

    #[test]
    fn test_capacity_filter_zero_capacity_rejects_both() {
        let filter = CapacityFilter::new(0.4, 0.9);
        let store = make_store(0, 0);

        assert!(filter.filter_source(&store));
        assert!(filter.filter_target(&store));
    }

    #[test]
    fn test_snap_count_filter() {
        let filter = SnapCountFilter::new(3, 3);

        let mut store = make_store(100, 50);
        assert!(!filter.filter_source(&store));
        assert!(!filter.filter_target(&store));

        store.stats.sending_snap_count = 3;
        assert!(filter.filter_source(&store));
        assert!(!filter.filter_target(&store));

        store.stats.receiving_snap_count = 4;
        assert!(filter.filter_target(&store));
    }
}
