//! Replica-mutation operators and the balance plan.
//!
//! Operators are the atomic instructions the executor ships to storage
//! nodes: grow a region onto a store, retire a replica, or move leadership.
//! A [`BalanceOperator`] composes them into a totally ordered sequence
//! scoped to a single region.

use serde::{Deserialize, Serialize};

use crate::cluster::{Peer, Region, RegionId};

/// An atomic replica-mutation instruction.
///
/// A closed set so the executor can dispatch exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    /// Grow `region_id` with a new replica identified by `peer`.
    AddPeer { region_id: RegionId, peer: Peer },

    /// Remove `peer` from `region_id`.
    RemovePeer { region_id: RegionId, peer: Peer },

    /// Move leadership of `region_id` from `from` to `to`. The executor
    /// polls at most `max_wait_count` rounds for confirmation.
    TransferLeader {
        region_id: RegionId,
        from: Peer,
        to: Peer,
        max_wait_count: u32,
    },

    /// Single-shot wrapper; see [`OnceOperator`].
    Once(OnceOperator),
}

impl Operator {
    pub fn add_peer(region_id: RegionId, peer: Peer) -> Self {
        Self::AddPeer { region_id, peer }
    }

    pub fn remove_peer(region_id: RegionId, peer: Peer) -> Self {
        Self::RemovePeer { region_id, peer }
    }

    pub fn transfer_leader(region_id: RegionId, from: Peer, to: Peer, max_wait_count: u32) -> Self {
        Self::TransferLeader {
            region_id,
            from,
            to,
            max_wait_count,
        }
    }

    pub fn once(inner: Operator) -> Self {
        Self::Once(OnceOperator::new(inner))
    }

    /// The region this operator is scoped to.
    pub fn region_id(&self) -> RegionId {
        match self {
            Self::AddPeer { region_id, .. }
            | Self::RemovePeer { region_id, .. }
            | Self::TransferLeader { region_id, .. } => *region_id,
            Self::Once(once) => once.inner.region_id(),
        }
    }
}

/// Wraps an operator so it is dispatched at most once.
///
/// The first [`OnceOperator::dispatch`] yields the inner operator; any later
/// attempt is a no-op reported as already finished. This protects against
/// duplicate dispatch when a reactive trigger re-fires before the executor
/// acknowledges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnceOperator {
    inner: Box<Operator>,
    finished: bool,
}

impl OnceOperator {
    pub fn new(inner: Operator) -> Self {
        Self {
            inner: Box::new(inner),
            finished: false,
        }
    }

    /// The wrapped instruction, without consuming the shot.
    pub fn inner(&self) -> &Operator {
        &self.inner
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Take the single shot. Returns the inner operator on the first call
    /// and `None` afterwards.
    pub fn dispatch(&mut self) -> Option<&Operator> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(&self.inner)
    }
}

/// An ordered operator sequence scoped to one region.
///
/// The region snapshot the plan was computed against is retained so the
/// executor can detect concurrent membership changes before applying it.
/// The executor must not reorder the sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceOperator {
    region: Region,
    ops: Vec<Operator>,
}

impl BalanceOperator {
    pub fn new(region: Region, ops: Vec<Operator>) -> Self {
        Self { region, ops }
    }

    /// The region snapshot this plan was computed against.
    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn region_id(&self) -> RegionId {
        self.region.id
    }

    pub fn ops(&self) -> &[Operator] {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut [Operator] {
        &mut self.ops
    }

    /// Whether the region has drifted from the planned-against snapshot.
    /// A drifted plan must be discarded by the executor.
    pub fn region_changed(&self, current: &Region) -> bool {
        current != &self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u64, store_id: u64) -> Peer {
        Peer { id, store_id }
    }

    #[test]
    fn test_region_id_accessor() {
        let add = Operator::add_peer(7, peer(1, 10));
        let transfer = Operator::transfer_leader(7, peer(1, 10), peer(2, 20), 3);
        let once = Operator::once(Operator::remove_peer(7, peer(1, 10)));

        assert_eq!(add.region_id(), 7);
        assert_eq!(transfer.region_id(), 7);
        assert_eq!(once.region_id(), 7);
    }

    #[test]
    fn test_once_dispatches_exactly_once() {
        let inner = Operator::add_peer(7, peer(1, 10));
        let mut once = OnceOperator::new(inner.clone());

        assert!(!once.is_finished());
        assert_eq!(once.dispatch(), Some(&inner));
        assert!(once.is_finished());
        assert_eq!(once.dispatch(), None);
        assert_eq!(once.dispatch(), None);
    }

    #[test]
    fn test_region_drift_detection() {
        let region = Region::new(7, vec![peer(1, 10), peer(2, 20)]);
        let plan = BalanceOperator::new(region.clone(), vec![Operator::add_peer(7, peer(3, 30))]);

        assert!(!plan.region_changed(&region));

        let mut drifted = region;
        drifted.peers.push(peer(4, 40));
        assert!(plan.region_changed(&drifted));
    }
}
