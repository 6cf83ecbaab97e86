//! Answers "which block holds element id X" for ways and nodes.
//!
//! Both searches rely on the file-wide ordering invariant: way ids grow
//! monotonically across way blocks, and node blocks cover disjoint,
//! increasing id ranges. Hints (block numbers from previous resolutions) are
//! checked first when the hint list is within the budget; they are purely an
//! optimization and never a correctness filter.

use ahash::AHashMap;

use crate::index::BlockIndex;
use crate::{Error, Result};

pub struct Locator<'a> {
    way_blocks: &'a [(u32, i64)],
    node_blocks: &'a [(u32, i64, i64)],
    relation_blocks: &'a AHashMap<i64, u32>,
    way_hint_budget: usize,
    node_hint_budget: usize,
}

impl<'a> Locator<'a> {
    /// Validates the ordering invariants and builds the search structure.
    /// An index violating monotonicity would make the binary searches return
    /// wrong blocks, so it is rejected here.
    pub fn new(index: &'a BlockIndex) -> Result<Self> {
        for pair in index.way_blocks.windows(2) {
            if pair[1].0 <= pair[0].0 || pair[1].1 < pair[0].1 {
                return Err(Error::UnsortedIndex { block: pair[1].0 });
            }
        }
        for &(block, min_id, max_id) in &index.node_blocks {
            if min_id > max_id {
                return Err(Error::UnsortedIndex { block });
            }
        }
        for pair in index.node_blocks.windows(2) {
            if pair[1].0 <= pair[0].0 || pair[1].1 <= pair[0].2 {
                return Err(Error::UnsortedIndex { block: pair[1].0 });
            }
        }

        Ok(Locator {
            way_blocks: &index.way_blocks,
            node_blocks: &index.node_blocks,
            relation_blocks: &index.relation_blocks,
            way_hint_budget: BlockIndex::hint_budget(index.way_count()),
            node_hint_budget: BlockIndex::hint_budget(index.node_count()),
        })
    }

    /// Block holding the given way id. A block owns an id when its recorded
    /// max is at or above the id and the previous block's max is below it.
    pub fn find_way_block(&self, id: i64, hints: &[u32]) -> Result<u32> {
        if !hints.is_empty() && hints.len() <= self.way_hint_budget {
            for &hint in hints {
                if let Ok(pos) = self.way_blocks.binary_search_by_key(&hint, |&(b, _)| b) {
                    let owns = self.way_blocks[pos].1 >= id
                        && (pos == 0 || self.way_blocks[pos - 1].1 < id);
                    if owns {
                        return Ok(hint);
                    }
                }
            }
            // hints exhausted without a match; fall through to the search
        }

        let pos = self.way_blocks.partition_point(|&(_, max_id)| max_id < id);
        if pos == self.way_blocks.len() {
            return Err(Error::WayNotFound(id));
        }
        Ok(self.way_blocks[pos].0)
    }

    /// Block whose node id range contains the given id.
    pub fn find_node_block(&self, id: i64, hints: &[u32]) -> Result<u32> {
        if !hints.is_empty() && hints.len() <= self.node_hint_budget {
            for &hint in hints {
                if let Ok(pos) = self.node_blocks.binary_search_by_key(&hint, |&(b, _, _)| b) {
                    let (_, min_id, max_id) = self.node_blocks[pos];
                    if min_id <= id && id <= max_id {
                        return Ok(hint);
                    }
                }
            }
        }

        let pos = self
            .node_blocks
            .partition_point(|&(_, _, max_id)| max_id < id);
        if pos == self.node_blocks.len() {
            return Err(Error::NodeNotFound(id));
        }
        let (block, min_id, _) = self.node_blocks[pos];
        if id < min_id {
            // id falls into the gap between two disjoint ranges
            return Err(Error::NodeNotFound(id));
        }
        Ok(block)
    }

    pub fn find_relation_block(&self, id: i64) -> Result<u32> {
        self.relation_blocks
            .get(&id)
            .copied()
            .ok_or(Error::RelationNotFound(id))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn index() -> BlockIndex {
        BlockIndex {
            blocks: Vec::new(),
            way_blocks: vec![(3, 500), (5, 900), (7, 2000)],
            node_blocks: vec![(0, 1, 100), (1, 101, 200), (2, 201, 300)],
            relation_blocks: AHashMap::from_iter([(9000, 8)]),
        }
    }

    #[test]
    fn rejects_non_monotonic_way_index() {
        let mut idx = index();
        idx.way_blocks = vec![(3, 900), (5, 500)];
        assert!(matches!(
            Locator::new(&idx),
            Err(Error::UnsortedIndex { block: 5 })
        ));
    }

    #[test]
    fn rejects_overlapping_node_ranges() {
        let mut idx = index();
        idx.node_blocks = vec![(0, 1, 150), (1, 101, 200)];
        assert!(matches!(
            Locator::new(&idx),
            Err(Error::UnsortedIndex { block: 1 })
        ));
    }

    #[test]
    fn way_lookup_honors_ownership_rule() {
        let idx = index();
        let locator = Locator::new(&idx).unwrap();
        assert_eq!(locator.find_way_block(1, &[]).unwrap(), 3);
        assert_eq!(locator.find_way_block(500, &[]).unwrap(), 3);
        assert_eq!(locator.find_way_block(501, &[]).unwrap(), 5);
        assert_eq!(locator.find_way_block(2000, &[]).unwrap(), 7);
        assert!(matches!(
            locator.find_way_block(2001, &[]),
            Err(Error::WayNotFound(2001))
        ));
    }

    #[test]
    fn node_lookup_uses_range_containment() {
        let idx = index();
        let locator = Locator::new(&idx).unwrap();
        assert_eq!(locator.find_node_block(150, &[]).unwrap(), 1);
        assert_eq!(locator.find_node_block(1, &[]).unwrap(), 0);
        assert_eq!(locator.find_node_block(300, &[]).unwrap(), 2);
        assert!(locator.find_node_block(301, &[]).is_err());
        assert!(locator.find_node_block(0, &[]).is_err());
    }

    #[test]
    fn node_gap_between_ranges_is_not_found() {
        let mut idx = index();
        idx.node_blocks = vec![(0, 1, 100), (1, 151, 200)];
        let locator = Locator::new(&idx).unwrap();
        assert!(matches!(
            locator.find_node_block(120, &[]),
            Err(Error::NodeNotFound(120))
        ));
    }

    #[test]
    fn wrong_hints_fall_back_to_search() {
        let idx = index();
        let locator = Locator::new(&idx).unwrap();
        // hint points at the wrong block; the search must still win
        assert_eq!(locator.find_way_block(700, &[3]).unwrap(), 5);
        assert_eq!(locator.find_node_block(42, &[2]).unwrap(), 0);
    }

    #[test]
    fn oversized_hint_list_is_ignored() {
        let idx = index();
        let locator = Locator::new(&idx).unwrap();
        // budget for 3 way blocks is 1; two hints exceed it
        assert_eq!(locator.find_way_block(700, &[3, 5]).unwrap(), 5);
    }

    proptest! {
        /// Lookups answer the same with or without hints, correct or not.
        #[test]
        fn hints_never_change_the_answer(
            id in 1i64..2000,
            hints in prop::collection::vec(0u32..9, 0..3),
        ) {
            let idx = index();
            let locator = Locator::new(&idx).unwrap();

            let bare = locator.find_way_block(id, &[]).unwrap();
            let hinted = locator.find_way_block(id, &hints).unwrap();
            prop_assert_eq!(bare, hinted);

            if let Ok(bare) = locator.find_node_block(id, &[]) {
                prop_assert_eq!(bare, locator.find_node_block(id, &hints).unwrap());
            } else {
                prop_assert!(locator.find_node_block(id, &hints).is_err());
            }
        }
    }
}
