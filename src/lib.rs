//! Streaming extraction of geographic elements (nodes, ways, relations) from
//! OSM pbf extracts, without loading the whole file into memory.
//!
//! The file is indexed once (block offsets, way/node id coverage, relation
//! placement), then walked in reverse block order with parallel per-element
//! resolution. The index and a progress marker are persisted as sidecar files
//! so an interrupted run can resume where it stopped.

pub mod args;
pub mod assemble;
pub mod element;
pub mod index;
pub mod locator;
pub mod osmpbf;
pub mod parallel;
pub mod session;
pub mod sink;
pub mod stats;
pub mod store;

pub use crate::assemble::{Assembled, Assembler};
pub use crate::element::{BoundingBox, Element, Node, Relation, RelationMember, Tag, Tags, Way};
pub use crate::index::{BlockIndex, ProgressMarker};
pub use crate::locator::Locator;
pub use crate::session::{Config, Session};
pub use crate::sink::{
    AcceptAll, CollectingSink, ElementSink, KeyListClassifier, LineFileSink, StyleClassifier,
};
pub use crate::stats::Stats;
pub use crate::store::BlockStore;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fundamental i/o failure; aborts the session.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed protobuf payload in a blob.
    #[error("malformed protobuf: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Malformed string table entry.
    #[error("string table entry is not valid UTF-8: {0}")]
    BadString(#[from] std::str::Utf8Error),

    /// A blob is neither raw nor zlib compressed.
    #[error("unsupported blob compression at offset {offset}")]
    UnknownCompression { offset: u64 },

    /// A primitive block holds more than one element kind. The index
    /// classifies a block by its single kind, so such input is refused
    /// instead of being silently misindexed.
    #[error("primitive block mixes element kinds")]
    MixedBlock,

    /// Input uses a feature this reader does not handle.
    #[error("unsupported block content: {0}")]
    UnsupportedBlock(String),

    /// A referenced way id lies outside the coverage of the way index.
    #[error("way {0} is not covered by the way index")]
    WayNotFound(i64),

    /// A referenced node id lies outside every indexed node block range.
    #[error("node {0} is not covered by the node index")]
    NodeNotFound(i64),

    /// The requested relation is absent from the relation index.
    #[error("relation {0} is not covered by the relation index")]
    RelationNotFound(i64),

    /// A block number outside the indexed range was requested.
    #[error("block {0} is out of the indexed range")]
    UnknownBlock(u32),

    /// A sidecar index file could not be parsed. Recoverable: the caller
    /// discards the sidecars and rebuilds the index from the input file.
    #[error("corrupt index sidecar {path}: {reason}")]
    CorruptSidecar { path: PathBuf, reason: String },

    /// The way/node index violates the id ordering the binary search
    /// depends on.
    #[error("index violates id monotonicity at block {block}")]
    UnsortedIndex { block: u32 },

    /// Wraps a failure with the number of the block being processed.
    #[error("block {block}: {source}")]
    Block {
        block: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn in_block(self, block: u32) -> Error {
        Error::Block {
            block,
            source: Box::new(self),
        }
    }

    /// True for conditions that are recovered by dropping a single element
    /// (missing reference, malformed tag table), as opposed to block or
    /// file level failures.
    pub fn is_element_error(&self) -> bool {
        matches!(
            self,
            Error::WayNotFound(_)
                | Error::NodeNotFound(_)
                | Error::RelationNotFound(_)
                | Error::BadString(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
