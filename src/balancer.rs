//! Balance-plan assembly.
//!
//! Two balancers share the same selection machinery:
//! - [`ResourceBalancer`] runs periodically over the whole cluster, picks an
//!   overloaded store, one of its regions, and an underloaded target, and
//!   emits a replica move (leadership first when the source holds the lead).
//! - [`DefaultBalancer`] reacts to a single region whose replica count
//!   diverges from the configured target and emits one add or remove.
//!
//! Both are pure functions of a [`ClusterView`] snapshot: no I/O, no
//! retries, and either a plan or nothing.

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::cluster::{AllocError, ClusterView, Peer, Region, Store, StoreId};
use crate::config::BalanceConfig;
use crate::filter::{CapacityFilter, Filter, SnapCountFilter};
use crate::operator::{BalanceOperator, Operator};

/// Balancing errors
#[derive(Error, Debug)]
pub enum BalanceError {
    #[error("peer id allocation failed: {0}")]
    IdAlloc(#[from] AllocError),
}

pub type Result<T> = std::result::Result<T, BalanceError>;

/// Produces a balance plan for a cluster snapshot, or nothing when no
/// worthwhile move exists.
pub trait Balancer {
    fn balance(&self, cluster: &dyn ClusterView) -> Result<Option<BalanceOperator>>;
}

/// Leader share of a store scaled to `[0, 100]`.
pub fn leader_score(leader_count: u64, region_count: u64) -> u64 {
    if region_count == 0 {
        return 0;
    }
    leader_count * 100 / region_count
}

/// Blended store load score in `[0, 100]`: capacity drift dominates, leader
/// share co-migrates read/write heat with the data.
pub fn store_score(store: &Store, leader_count: u64, region_count: u64) -> u64 {
    let used = store.used_ratio_score() as f64;
    let leader = leader_score(leader_count, region_count) as f64;
    (used * 0.6 + leader * 0.4) as u64
}

/// Region selection outcome: the region to move, its leader, and, when the
/// source store only holds a follower, that local follower.
struct BalanceRegion {
    region: Region,
    leader: Peer,
    follower: Option<Peer>,
    leader_balance: bool,
}

/// Follower peers of `region` keyed by store, plus the store ids of every
/// current replica (a region must never gain a second replica on a store it
/// already occupies).
fn follower_peers(region: &Region, leader: &Peer) -> (BTreeMap<StoreId, Peer>, HashSet<StoreId>) {
    let mut followers = BTreeMap::new();
    let mut excluded = HashSet::with_capacity(region.peers.len());
    for peer in &region.peers {
        excluded.insert(peer.store_id);
        if peer.id == leader.id {
            continue;
        }
        followers.insert(peer.store_id, peer.clone());
    }
    (followers, excluded)
}

/// Cluster-wide opportunistic balancer.
pub struct ResourceBalancer {
    filters: Vec<Box<dyn Filter>>,
    cfg: BalanceConfig,
}

impl ResourceBalancer {
    pub fn new(cfg: BalanceConfig) -> Self {
        let mut rb = Self {
            filters: Vec::new(),
            cfg: cfg.clone(),
        };
        rb.add_filter(Box::new(CapacityFilter::new(
            cfg.min_capacity_used_ratio,
            cfg.max_capacity_used_ratio,
        )));
        rb.add_filter(Box::new(SnapCountFilter::new(
            cfg.max_sending_snap_count,
            cfg.max_receiving_snap_count,
        )));
        rb
    }

    fn add_filter(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    fn filter_source(&self, store: &Store) -> bool {
        self.filters.iter().any(|f| f.filter_source(store))
    }

    fn filter_target(&self, store: &Store) -> bool {
        self.filters.iter().any(|f| f.filter_target(store))
    }

    /// Whether moving a replica from `old_peer`'s store to `new_peer`'s
    /// store improves the imbalance enough to be worth the churn.
    ///
    /// With `is_leader_peer` the target is scored as if it already carried
    /// one more leader, modeling the post-move state.
    fn check_score(
        &self,
        cluster: &dyn ClusterView,
        old_peer: &Peer,
        new_peer: &Peer,
        is_leader_peer: bool,
    ) -> bool {
        let region_count = cluster.region_count() as u64;
        let (Some(old_store), Some(new_store)) = (
            cluster.get_store(old_peer.store_id),
            cluster.get_store(new_peer.store_id),
        ) else {
            debug!(
                old_store = old_peer.store_id,
                new_store = new_peer.store_id,
                "Score check failed, store missing from view"
            );
            return false;
        };

        let old_score = store_score(
            &old_store,
            old_store.stats.leader_region_count,
            region_count,
        );
        let new_leader_count =
            new_store.stats.leader_region_count + u64::from(is_leader_peer);
        let new_score = store_score(&new_store, new_leader_count, region_count);

        let diff = old_score as i64 - new_score as i64;
        if diff as f64 <= old_score as f64 * self.cfg.max_diff_score_fraction {
            debug!(
                old_score,
                new_score, diff, "Score check failed, improvement below threshold"
            );
            return false;
        }

        true
    }

    /// Highest-score store, first-seen on ties. `None` when nothing
    /// qualifies.
    fn select_source_store<'a>(
        &self,
        stores: &'a [Store],
        region_count: u64,
        use_filter: bool,
    ) -> Option<&'a Store> {
        let mut best: Option<(&Store, u64)> = None;
        for store in stores {
            if use_filter && self.filter_source(store) {
                continue;
            }
            let score = store_score(store, store.stats.leader_region_count, region_count);
            match best {
                Some((_, top)) if score <= top => {}
                _ => best = Some((store, score)),
            }
        }
        best.map(|(store, _)| store)
    }

    /// Lowest-score store outside `excluded`, first-seen on ties.
    fn select_target_store<'a>(
        &self,
        stores: &'a [Store],
        excluded: &HashSet<StoreId>,
        region_count: u64,
        use_filter: bool,
    ) -> Option<&'a Store> {
        let mut best: Option<(&Store, u64)> = None;
        for store in stores {
            if excluded.contains(&store.id) {
                continue;
            }
            if use_filter && self.filter_target(store) {
                continue;
            }
            let score = store_score(store, store.stats.leader_region_count, region_count);
            match best {
                Some((_, bottom)) if score >= bottom => {}
                _ => best = Some((store, score)),
            }
        }
        best.map(|(store, _)| store)
    }

    /// Pick the region to move: a leader region of the most loaded store if
    /// it has one, otherwise any region it hosts (follower move).
    fn select_balance_region(
        &self,
        cluster: &dyn ClusterView,
        stores: &[Store],
    ) -> Option<BalanceRegion> {
        let region_count = cluster.region_count() as u64;
        let Some(source) = self.select_source_store(stores, region_count, true) else {
            warn!("No source store qualifies for balance");
            return None;
        };
        let store_id = source.id;

        if let Some(region) = cluster.rand_leader_region(store_id) {
            let Some(leader) = region.peer_on_store(store_id).cloned() else {
                warn!(
                    store_id,
                    region_id = region.id,
                    "Leader region has no replica on its own store"
                );
                return None;
            };
            return Some(BalanceRegion {
                region,
                leader,
                follower: None,
                leader_balance: true,
            });
        }

        // The store may hold only follower replicas; a follower move is
        // still useful, it just needs no leader transfer.
        debug!(store_id, "No leader region on source store, sampling any role");
        let (region, leader, follower) = cluster.rand_region(store_id)?;
        Some(BalanceRegion {
            region,
            leader,
            follower,
            leader_balance: false,
        })
    }

    /// Least loaded follower store becomes the new leader. Missing stores
    /// are skipped.
    fn select_new_leader_peer(
        &self,
        cluster: &dyn ClusterView,
        followers: &BTreeMap<StoreId, Peer>,
    ) -> Option<Peer> {
        let stores: Vec<Store> = followers
            .keys()
            .filter_map(|id| cluster.get_store(*id))
            .collect();

        let region_count = cluster.region_count() as u64;
        let store = self.select_target_store(&stores, &HashSet::new(), region_count, false)?;
        followers.get(&store.id).cloned()
    }

    /// Pick the target store for a new replica and allocate its peer id.
    fn select_add_peer(
        &self,
        cluster: &dyn ClusterView,
        stores: &[Store],
        excluded: &HashSet<StoreId>,
    ) -> Result<Option<Peer>> {
        let region_count = cluster.region_count() as u64;
        let Some(store) = self.select_target_store(stores, excluded, region_count, true) else {
            warn!("No target store qualifies to host a new replica");
            return Ok(None);
        };

        let peer_id = cluster.id_alloc().alloc()?;
        Ok(Some(Peer {
            id: peer_id,
            store_id: store.id,
        }))
    }

    /// Most loaded follower store gives up its replica.
    fn select_remove_peer(
        &self,
        cluster: &dyn ClusterView,
        followers: &BTreeMap<StoreId, Peer>,
    ) -> Option<Peer> {
        let stores: Vec<Store> = followers
            .keys()
            .filter_map(|id| cluster.get_store(*id))
            .collect();

        let region_count = cluster.region_count() as u64;
        let store = self.select_source_store(&stores, region_count, false)?;
        followers.get(&store.id).cloned()
    }

    fn do_leader_balance(
        &self,
        cluster: &dyn ClusterView,
        region: &Region,
        leader: &Peer,
        new_peer: Peer,
    ) -> Option<BalanceOperator> {
        let region_id = region.id;

        // A single-replica region cannot transfer leadership away first;
        // membership semantics permit the add and remove as a joint change.
        if cluster.meta().max_peer_count == 1 {
            if !self.check_score(cluster, leader, &new_peer, true) {
                return None;
            }
            let ops = vec![
                Operator::add_peer(region_id, new_peer),
                Operator::remove_peer(region_id, leader.clone()),
            ];
            return Some(BalanceOperator::new(region.clone(), ops));
        }

        if !self.check_score(cluster, leader, &new_peer, false) {
            return None;
        }

        let (followers, _) = follower_peers(region, leader);
        let Some(new_leader) = self.select_new_leader_peer(cluster, &followers) else {
            warn!(region_id, "No follower qualifies as new leader");
            return None;
        };

        // Leadership moves before membership shrinks, so quorum never
        // includes the store being drained as leader.
        let ops = vec![
            Operator::transfer_leader(
                region_id,
                leader.clone(),
                new_leader,
                self.cfg.max_wait_count,
            ),
            Operator::add_peer(region_id, new_peer),
            Operator::remove_peer(region_id, leader.clone()),
        ];
        Some(BalanceOperator::new(region.clone(), ops))
    }

    fn do_follower_balance(
        &self,
        cluster: &dyn ClusterView,
        region: &Region,
        follower: &Peer,
        new_peer: Peer,
    ) -> Option<BalanceOperator> {
        if !self.check_score(cluster, follower, &new_peer, false) {
            return None;
        }

        let ops = vec![
            Operator::add_peer(region.id, new_peer),
            Operator::remove_peer(region.id, follower.clone()),
        ];
        Some(BalanceOperator::new(region.clone(), ops))
    }
}

impl Balancer for ResourceBalancer {
    #[instrument(skip(self, cluster))]
    fn balance(&self, cluster: &dyn ClusterView) -> Result<Option<BalanceOperator>> {
        let stores = cluster.stores();
        let Some(selected) = self.select_balance_region(cluster, &stores) else {
            return Ok(None);
        };

        // Reconciling replica counts is the reactive balancer's job.
        let max_peer_count = cluster.meta().max_peer_count as usize;
        if selected.region.peers.len() != max_peer_count {
            warn!(
                region_id = selected.region.id,
                peers = selected.region.peers.len(),
                max_peer_count,
                "Region peer count diverges from target, skipping capacity balance"
            );
            return Ok(None);
        }

        let (_, excluded) = follower_peers(&selected.region, &selected.leader);
        let Some(new_peer) = self.select_add_peer(cluster, &stores, &excluded)? else {
            return Ok(None);
        };

        if selected.leader_balance {
            return Ok(self.do_leader_balance(
                cluster,
                &selected.region,
                &selected.leader,
                new_peer,
            ));
        }

        let Some(follower) = selected.follower else {
            warn!(
                region_id = selected.region.id,
                "Sampled region has no follower replica on the source store"
            );
            return Ok(None);
        };
        Ok(self.do_follower_balance(cluster, &selected.region, &follower, new_peer))
    }
}

/// Reactive per-region balancer reconciling replica counts.
///
/// Invoked for a specific region whose peer count diverges from the
/// configured target; emits a single once-wrapped add or remove.
pub struct DefaultBalancer {
    resource: ResourceBalancer,
    region: Region,
    leader: Peer,
}

impl DefaultBalancer {
    pub fn new(region: Region, leader: Peer, cfg: BalanceConfig) -> Self {
        Self {
            resource: ResourceBalancer::new(cfg),
            region,
            leader,
        }
    }

    fn add_peer(&self, cluster: &dyn ClusterView) -> Result<Option<BalanceOperator>> {
        let stores = cluster.stores();
        let excluded: HashSet<StoreId> =
            self.region.peers.iter().map(|p| p.store_id).collect();

        let Some(peer) = self.resource.select_add_peer(cluster, &stores, &excluded)? else {
            warn!(region_id = self.region.id, "No store available to grow the region");
            return Ok(None);
        };

        let op = Operator::once(Operator::add_peer(self.region.id, peer));
        Ok(Some(BalanceOperator::new(self.region.clone(), vec![op])))
    }

    fn remove_peer(&self, cluster: &dyn ClusterView) -> Result<Option<BalanceOperator>> {
        let mut followers = BTreeMap::new();
        for peer in &self.region.peers {
            if peer.id == self.leader.id {
                continue;
            }
            followers.insert(peer.store_id, peer.clone());
        }

        let Some(peer) = self.resource.select_remove_peer(cluster, &followers) else {
            warn!(region_id = self.region.id, "No follower available to shrink the region");
            return Ok(None);
        };

        let op = Operator::once(Operator::remove_peer(self.region.id, peer));
        Ok(Some(BalanceOperator::new(self.region.clone(), vec![op])))
    }
}

impl Balancer for DefaultBalancer {
    #[instrument(skip(self, cluster), fields(region_id = self.region.id))]
    fn balance(&self, cluster: &dyn ClusterView) -> Result<Option<BalanceOperator>> {
        let peer_count = self.region.peers.len();
        let max_peer_count = cluster.meta().max_peer_count as usize;

        if peer_count == max_peer_count {
            Ok(None)
        } else if peer_count < max_peer_count {
            self.add_peer(cluster)
        } else {
            self.remove_peer(cluster)
        }
    }
}
