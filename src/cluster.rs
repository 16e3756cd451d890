//! Cluster data model and the read-only view consumed by the balancers.
//!
//! A balance round runs against a logically consistent snapshot of the
//! cluster: stores with their heartbeat statistics, regions with their
//! replica placements, and the designated leader of every region. The
//! [`ClusterView`] trait is that surface; [`ClusterSnapshot`] is the owned
//! in-memory implementation used by the placement driver (and by tests).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Storage node identifier.
pub type StoreId = u64;
/// Key-range shard identifier.
pub type RegionId = u64;
/// Replica identifier, unique across the process lifetime.
pub type PeerId = u64;

/// Id allocation errors
#[derive(Error, Debug, Clone)]
pub enum AllocError {
    #[error("id space exhausted")]
    Exhausted,

    #[error("id storage unavailable: {0}")]
    Unavailable(String),
}

/// A single replica of a region placed on a specific store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub store_id: StoreId,
}

/// A contiguous key-range shard and its replica set.
///
/// Peer store ids within a region are unique; a region always has at least
/// one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub peers: Vec<Peer>,
}

impl Region {
    pub fn new(id: RegionId, peers: Vec<Peer>) -> Self {
        Self { id, peers }
    }

    /// Find the replica hosted on `store_id`, if any.
    pub fn peer_on_store(&self, store_id: StoreId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.store_id == store_id)
    }

    pub fn peer_by_id(&self, peer_id: PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == peer_id)
    }
}

/// Store statistics reported by heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Total disk capacity in bytes.
    pub capacity: u64,
    /// Remaining free bytes. Never exceeds `capacity`.
    pub available: u64,
    /// Replicas hosted on this store.
    pub region_count: u64,
    /// Replicas on this store currently serving as region leader.
    pub leader_region_count: u64,
    /// Snapshots this store is currently sending.
    pub sending_snap_count: u32,
    /// Snapshots this store is currently applying.
    pub receiving_snap_count: u32,
    /// Unix seconds of the last heartbeat, 0 if never seen.
    pub last_heartbeat_secs: u64,
}

/// A storage node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub id: StoreId,
    pub address: String,
    pub labels: BTreeMap<String, String>,
    pub stats: StoreStats,
}

impl Store {
    /// Fraction of capacity in use, in `[0, 1]`. A store that has not yet
    /// reported capacity reads as empty.
    pub fn used_ratio(&self) -> f64 {
        if self.stats.capacity == 0 {
            return 0.0;
        }
        self.stats.capacity.saturating_sub(self.stats.available) as f64
            / self.stats.capacity as f64
    }

    /// Used ratio scaled to an integer in `[0, 100]`.
    pub fn used_ratio_score(&self) -> u64 {
        (self.used_ratio() * 100.0) as u64
    }
}

/// Process-wide cluster configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMeta {
    pub cluster_id: u64,
    /// Target replica count per region, at least 1.
    pub max_peer_count: u32,
}

/// Allocates fresh peer ids.
///
/// Implementations must be concurrency-safe and strictly increasing: every
/// returned id is unique for the process lifetime and greater than the
/// previously returned one. Failure is reported, never a silent zero.
pub trait IdAllocator: Send + Sync {
    fn alloc(&self) -> Result<PeerId, AllocError>;
}

/// In-process atomic id allocator.
#[derive(Debug, Default)]
pub struct MonotonicIdAllocator {
    next: AtomicU64,
}

impl MonotonicIdAllocator {
    /// Ids are handed out starting at `base + 1`.
    pub fn new(base: u64) -> Self {
        Self {
            next: AtomicU64::new(base),
        }
    }
}

impl IdAllocator for MonotonicIdAllocator {
    fn alloc(&self) -> Result<PeerId, AllocError> {
        let id = self.next.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        if id == 0 {
            return Err(AllocError::Exhausted);
        }
        Ok(id)
    }
}

/// Read-only, logically consistent view of the cluster.
///
/// Within one balance round, repeated reads of the same entity return the
/// same value.
pub trait ClusterView {
    /// All known stores.
    fn stores(&self) -> Vec<Store>;

    fn get_store(&self, store_id: StoreId) -> Option<Store>;

    fn meta(&self) -> ClusterMeta;

    /// Total number of regions in the cluster.
    fn region_count(&self) -> usize;

    /// A uniformly random region whose leader lives on `store_id`.
    fn rand_leader_region(&self, store_id: StoreId) -> Option<Region>;

    /// A uniformly random region hosted on `store_id` in any role, together
    /// with its leader and the follower replica local to that store. The
    /// follower is absent when the local replica turns out to be the leader.
    fn rand_region(&self, store_id: StoreId) -> Option<(Region, Peer, Option<Peer>)>;

    /// The peer id allocator backing this cluster.
    fn id_alloc(&self) -> &dyn IdAllocator;
}

/// Owned snapshot of the cluster implementing [`ClusterView`].
///
/// Iteration over stores and regions is in ascending id order, so selection
/// tie-breaks are deterministic. Region sampling draws from an internal
/// PRNG; seed it with [`ClusterSnapshot::with_rng_seed`] for reproducible
/// rounds.
pub struct ClusterSnapshot {
    meta: ClusterMeta,
    stores: BTreeMap<StoreId, Store>,
    regions: BTreeMap<RegionId, Region>,
    leaders: BTreeMap<RegionId, PeerId>,
    id_alloc: Arc<dyn IdAllocator>,
    rng: Mutex<StdRng>,
}

impl ClusterSnapshot {
    pub fn new(meta: ClusterMeta) -> Self {
        Self {
            meta,
            stores: BTreeMap::new(),
            regions: BTreeMap::new(),
            leaders: BTreeMap::new(),
            id_alloc: Arc::new(MonotonicIdAllocator::new(0)),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Seed the region-sampling PRNG for deterministic selection.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Replace the peer id allocator.
    pub fn with_id_alloc(mut self, id_alloc: Arc<dyn IdAllocator>) -> Self {
        self.id_alloc = id_alloc;
        self
    }

    pub fn add_store(&mut self, store: Store) {
        self.stores.insert(store.id, store);
    }

    /// Record a region and designate its leader peer.
    pub fn add_region(&mut self, region: Region, leader: PeerId) {
        if region.peer_by_id(leader).is_none() {
            warn!(
                region_id = region.id,
                leader, "Designated leader is not a member of the region"
            );
        }
        self.leaders.insert(region.id, leader);
        self.regions.insert(region.id, region);
    }

    pub fn get_region(&self, region_id: RegionId) -> Option<&Region> {
        self.regions.get(&region_id)
    }

    /// The leader replica of `region_id`, if consistently recorded.
    pub fn leader_peer(&self, region_id: RegionId) -> Option<Peer> {
        let leader_id = *self.leaders.get(&region_id)?;
        self.regions
            .get(&region_id)?
            .peer_by_id(leader_id)
            .cloned()
    }

    fn rng(&self) -> std::sync::MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClusterView for ClusterSnapshot {
    fn stores(&self) -> Vec<Store> {
        self.stores.values().cloned().collect()
    }

    fn get_store(&self, store_id: StoreId) -> Option<Store> {
        self.stores.get(&store_id).cloned()
    }

    fn meta(&self) -> ClusterMeta {
        self.meta
    }

    fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn rand_leader_region(&self, store_id: StoreId) -> Option<Region> {
        let candidates: Vec<&Region> = self
            .regions
            .values()
            .filter(|region| {
                self.leaders
                    .get(&region.id)
                    .and_then(|id| region.peer_by_id(*id))
                    .is_some_and(|leader| leader.store_id == store_id)
            })
            .collect();

        candidates.choose(&mut *self.rng()).map(|r| (*r).clone())
    }

    fn rand_region(&self, store_id: StoreId) -> Option<(Region, Peer, Option<Peer>)> {
        let candidates: Vec<&Region> = self
            .regions
            .values()
            .filter(|region| region.peer_on_store(store_id).is_some())
            .collect();

        let region = (*candidates.choose(&mut *self.rng())?).clone();

        let Some(leader) = self
            .leaders
            .get(&region.id)
            .and_then(|id| region.peer_by_id(*id))
            .cloned()
        else {
            warn!(region_id = region.id, "Region has no resolvable leader");
            return None;
        };

        let follower = region
            .peer_on_store(store_id)
            .filter(|p| p.id != leader.id)
            .cloned();

        Some((region, leader, follower))
    }

    fn id_alloc(&self) -> &dyn IdAllocator {
        self.id_alloc.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn make_store(id: StoreId, capacity: u64, available: u64) -> Store {
        Store {
            id,
            address: format!("store-{id}:20160"),
            labels: BTreeMap::new(),
            stats: StoreStats {
                capacity,
                available,
                ..Default::default()
            },
        }
    }

    fn make_region(id: RegionId, peers: &[(PeerId, StoreId)]) -> Region {
        Region::new(
            id,
            peers
                .iter()
                .map(|&(id, store_id)| Peer { id, store_id })
                .collect(),
        )
    }

    fn meta() -> ClusterMeta {
        ClusterMeta {
            cluster_id: 1,
            max_peer_count: 3,
        }
    }

    #[test]
    fn test_used_ratio() {
        let store = make_store(1, 100, 25);
        assert_eq!(store.used_ratio(), 0.75);
        assert_eq!(store.used_ratio_score(), 75);
    }

    #[test]
    fn test_used_ratio_zero_capacity() {
        let store = make_store(1, 0, 0);
        assert_eq!(store.used_ratio(), 0.0);
        assert_eq!(store.used_ratio_score(), 0);
    }

    #[test]
    fn test_allocator_monotonic() {
        let alloc = MonotonicIdAllocator::new(100);
        let mut prev = 100;
        for _ in 0..1000 {
            let id = alloc.alloc().unwrap();
            assert!(id > prev);
            prev = id;
        }
    }

    #[test]
    fn test_allocator_unique_across_threads() {
        let alloc = Arc::new(MonotonicIdAllocator::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                (0..250)
                    .map(|_| alloc.alloc().unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = BTreeSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_rand_leader_region_only_returns_leader_regions() {
        let mut cluster = ClusterSnapshot::new(meta()).with_rng_seed(7);
        cluster.add_store(make_store(1, 100, 50));
        cluster.add_store(make_store(2, 100, 50));
        // Leader on store 1 for region 10, on store 2 for region 20.
        cluster.add_region(make_region(10, &[(101, 1), (102, 2)]), 101);
        cluster.add_region(make_region(20, &[(201, 1), (202, 2)]), 202);

        for _ in 0..10 {
            let region = cluster.rand_leader_region(1).unwrap();
            assert_eq!(region.id, 10);
        }
        assert!(cluster.rand_leader_region(3).is_none());
    }

    #[test]
    fn test_rand_region_reports_local_follower() {
        let mut cluster = ClusterSnapshot::new(meta()).with_rng_seed(7);
        cluster.add_region(make_region(10, &[(101, 1), (102, 2)]), 101);

        let (region, leader, follower) = cluster.rand_region(2).unwrap();
        assert_eq!(region.id, 10);
        assert_eq!(leader.id, 101);
        assert_eq!(follower.unwrap().id, 102);

        // The local replica on store 1 is the leader itself.
        let (_, _, follower) = cluster.rand_region(1).unwrap();
        assert!(follower.is_none());
    }

    #[test]
    fn test_seeded_sampling_is_deterministic() {
        let build = || {
            let mut cluster = ClusterSnapshot::new(meta()).with_rng_seed(42);
            for id in 0..20 {
                cluster.add_region(make_region(id, &[(1000 + id, 1)]), 1000 + id);
            }
            cluster
        };

        let a = build();
        let b = build();
        for _ in 0..20 {
            assert_eq!(
                a.rand_leader_region(1).map(|r| r.id),
                b.rand_leader_region(1).map(|r| r.id)
            );
        }
    }

    #[test]
    fn test_leader_peer_lookup() {
        let mut cluster = ClusterSnapshot::new(meta());
        cluster.add_region(make_region(10, &[(101, 1), (102, 2)]), 102);

        assert_eq!(cluster.leader_peer(10).unwrap().store_id, 2);
        assert!(cluster.leader_peer(11).is_none());
    }
}
