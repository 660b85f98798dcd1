//! Cluster topology: which ranks share a node, and who lists whom.

use std::collections::HashSet;

use crate::comm::Communicator;
use crate::error::{Error, Result};

/// Node membership of every rank in the embedding communicator.
///
/// Two ranks share a node when they report the same node master (the global
/// rank of local rank 0 of their node communicator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMap {
    masters: Vec<i32>,
    local_ranks: Vec<i32>,
    me: usize,
}

impl NodeMap {
    /// Build a map from per-rank node masters and local ranks.
    pub fn new(masters: Vec<i32>, local_ranks: Vec<i32>, me: usize) -> Self {
        assert_eq!(masters.len(), local_ranks.len());
        assert!(me < masters.len(), "rank {me} out of range");
        Self {
            masters,
            local_ranks,
            me,
        }
    }

    /// Collectively discover the map. `node` must be the node-local split of
    /// `global`.
    pub fn discover<C: Communicator>(node: &C, global: &C) -> Result<Self> {
        let size = global.size() as usize;
        let mut master = [global.rank()];
        node.broadcast(&mut master, 0)?;
        let mut masters = vec![0i32; size];
        global.allgather(&master, &mut masters)?;
        let mut local_ranks = vec![0i32; size];
        global.allgather(&[node.rank()], &mut local_ranks)?;
        Ok(Self::new(masters, local_ranks, global.rank() as usize))
    }

    /// Number of ranks covered.
    pub fn num_ranks(&self) -> usize {
        self.masters.len()
    }

    /// Global rank of `rank`'s node master.
    #[track_caller]
    pub fn master_of(&self, rank: i32) -> i32 {
        self.masters[rank as usize]
    }

    /// True when `rank` shares this rank's node.
    pub fn is_local(&self, rank: i32) -> bool {
        self.local_rank_of(rank).is_some()
    }

    /// Node-local rank of `rank`, if it shares this rank's node.
    pub fn local_rank_of(&self, rank: i32) -> Option<usize> {
        let r = usize::try_from(rank).ok().filter(|&r| r < self.masters.len())?;
        (self.masters[r] == self.masters[self.me]).then(|| self.local_ranks[r] as usize)
    }
}

/// Check a partner list before any collective uses it.
pub(crate) fn validate_partners(partners: &[i32], me: i32, size: i32) -> Result<()> {
    if partners.is_empty() {
        return Err(Error::InvalidRoster("no partners".into()));
    }
    let mut seen = HashSet::with_capacity(partners.len());
    for &p in partners {
        if p < 0 || p >= size {
            return Err(Error::InvalidRank(p));
        }
        if p == me {
            return Err(Error::InvalidRoster(format!("rank {me} lists itself")));
        }
        if !seen.insert(p) {
            return Err(Error::InvalidRoster(format!("rank {me} lists {p} twice")));
        }
    }
    Ok(())
}

/// Every rank's partner list, gathered.
#[derive(Debug, Clone)]
pub(crate) struct Rosters {
    displs: Vec<usize>,
    counts: Vec<usize>,
    flat: Vec<i32>,
}

impl Rosters {
    pub(crate) fn gather<C: Communicator>(global: &C, partners: &[i32]) -> Result<Self> {
        let (counts, flat) = global.allgather_varcount(partners)?;
        let counts: Vec<usize> = counts.iter().map(|&c| c as usize).collect();
        let displs = counts
            .iter()
            .scan(0, |acc, &c| {
                let d = *acc;
                *acc += c;
                Some(d)
            })
            .collect();
        Ok(Self {
            displs,
            counts,
            flat,
        })
    }

    pub(crate) fn of(&self, rank: i32) -> &[i32] {
        let r = rank as usize;
        &self.flat[self.displs[r]..self.displs[r] + self.counts[r]]
    }

    /// Position of `target` in `owner`'s roster.
    pub(crate) fn index_of(&self, owner: i32, target: i32) -> Option<usize> {
        self.of(owner).iter().position(|&p| p == target)
    }

    /// Every partner of `me` must list `me` back.
    pub(crate) fn check_symmetric(&self, me: i32) -> Result<()> {
        for &partner in self.of(me) {
            if self.index_of(partner, me).is_none() {
                return Err(Error::AsymmetricRoster { rank: me, partner });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::ThreadWorld;

    #[test]
    fn local_rank_of_matches_node() {
        // ranks 0,2 on node A (master 0), 1,3 on node B (master 1)
        let map = NodeMap::new(vec![0, 1, 0, 1], vec![0, 0, 1, 1], 2);
        assert_eq!(map.local_rank_of(0), Some(0));
        assert_eq!(map.local_rank_of(1), None);
        assert_eq!(map.local_rank_of(2), Some(1));
        assert_eq!(map.local_rank_of(9), None);
        assert_eq!(map.local_rank_of(-1), None);
        assert_eq!(map.master_of(3), 1);
    }

    #[test]
    fn partner_lists_are_validated() {
        assert!(validate_partners(&[1, 2], 0, 3).is_ok());
        assert!(matches!(validate_partners(&[], 0, 3), Err(Error::InvalidRoster(_))));
        assert!(matches!(validate_partners(&[0], 0, 3), Err(Error::InvalidRoster(_))));
        assert!(matches!(validate_partners(&[1, 1], 0, 3), Err(Error::InvalidRoster(_))));
        assert!(matches!(validate_partners(&[3], 0, 3), Err(Error::InvalidRank(3))));
    }

    #[test]
    fn discovery_over_threads() {
        let maps = ThreadWorld::with_nodes(vec![0, 1, 1, 0])
            .run(|rank| {
                let node = rank.world.split_shared().unwrap();
                NodeMap::discover(&node, &rank.world).unwrap()
            })
            .unwrap();
        assert_eq!(maps[0], NodeMap::new(vec![0, 1, 1, 0], vec![0, 0, 1, 1], 0));
        assert!(maps[3].is_local(0));
        assert_eq!(maps[2].local_rank_of(1), Some(0));
    }

    #[test]
    fn asymmetric_rosters_are_detected() {
        let results = ThreadWorld::new(3, 1)
            .run(|rank| {
                let me = rank.world.rank();
                // 0 lists 1 and 2, but 2 only lists 1.
                let partners: &[i32] = match me {
                    0 => &[1, 2],
                    1 => &[0, 2],
                    _ => &[1],
                };
                let rosters = Rosters::gather(&rank.world, partners).unwrap();
                assert_eq!(rosters.index_of(1, 2), Some(1));
                rosters.check_symmetric(me).err().map(|e| e.to_string())
            })
            .unwrap();
        assert!(results[0].as_deref().is_some_and(|e| e.contains("lists 2")));
        assert!(results[1].is_none());
        assert!(results[2].is_none());
    }
}
