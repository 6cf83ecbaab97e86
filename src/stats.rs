use std::fmt;
use std::ops::AddAssign;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    pub nodes_emitted: usize,
    pub ways_emitted: usize,
    pub relations_emitted: usize,
    /// Deliberately not emitted: unmatched style, no ring-role members.
    pub elements_skipped: usize,
    /// Dropped after a resolution failure (missing reference, bad strings).
    pub elements_dropped: usize,
    /// Blocks reprocessed on the serial fallback path.
    pub fallback_blocks: usize,
}

impl Stats {
    pub fn emitted(&self) -> usize {
        self.nodes_emitted + self.ways_emitted + self.relations_emitted
    }
}

impl AddAssign for Stats {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.nodes_emitted += other.nodes_emitted;
        self.ways_emitted += other.ways_emitted;
        self.relations_emitted += other.relations_emitted;
        self.elements_skipped += other.elements_skipped;
        self.elements_dropped += other.elements_dropped;
        self.fallback_blocks += other.fallback_blocks;
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            r#"Extracted:
  nodes:        {}
  ways:         {}
  relations:    {}
Skipped:        {}
Dropped:        {}
Fallback blocks: {}"#,
            self.nodes_emitted,
            self.ways_emitted,
            self.relations_emitted,
            self.elements_skipped,
            self.elements_dropped,
            self.fallback_blocks
        )
    }
}
