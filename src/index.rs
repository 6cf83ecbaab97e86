//! Block index: one pass over the file recording, per block, the byte range
//! and either the maximum way id, the node id range, or the relation ids it
//! holds. The index is persisted to sidecar files so an interrupted run can
//! resume without rescanning the input.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use byteorder::{ByteOrder, NetworkEndian};
use log::{debug, info, warn};
use prost::Message;

use crate::osmpbf::{self, BlockType};
use crate::parallel;
use crate::store::BlockStore;
use crate::{Error, Result};

const SUPPORTED_FEATURES: [&str; 2] = ["OsmSchema-V0.6", "DenseNodes"];

const BLOCKS_SIDECAR: &str = "blocks.idx";
const WAYS_SIDECAR: &str = "ways.idx";
const NODES_SIDECAR: &str = "nodes.idx";
const RELATIONS_SIDECAR: &str = "rels.idx";
const PROGRESS_SIDECAR: &str = "progress";

/// Byte range of one data blob within the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    pub offset: u64,
    pub len: u32,
}

#[derive(Debug, Default, PartialEq)]
pub struct BlockIndex {
    /// Byte ranges of all data blocks, in file order; the block number is
    /// the position in this list.
    pub blocks: Vec<BlockMeta>,
    /// `(block, max way id)`, ascending in block number. Way ids grow
    /// monotonically across blocks, which is what the locator's binary
    /// search depends on.
    pub way_blocks: Vec<(u32, i64)>,
    /// `(block, min node id, max node id)`, ascending in block number with
    /// disjoint ranges.
    pub node_blocks: Vec<(u32, i64, i64)>,
    /// Relations are sparse and unordered, so they get a direct map.
    pub relation_blocks: AHashMap<i64, u32>,
}

enum Classified {
    Header(osmpbf::HeaderBlock),
    Empty(BlockMeta),
    Ways(BlockMeta, i64),
    DenseNodes(BlockMeta, i64, i64),
    Relations(BlockMeta, Vec<i64>),
}

impl BlockIndex {
    /// Scans every blob of the file. Byte ranges are only discoverable by
    /// walking the length-prefixed records in order, so the scan itself is
    /// sequential; decode-and-classify of each blob runs in parallel.
    pub fn build(path: &Path) -> Result<BlockIndex> {
        let mut index = BlockIndex::default();
        let mut header_seen = false;

        let scanner = BlobScanner::open(path)?;
        parallel::process(
            scanner,
            |blob| blob.and_then(classify_blob),
            |classified| -> Result<Option<osmpbf::PrimitiveBlock>> {
                let (classified, garbage) = classified?;
                match classified {
                    Classified::Header(header) => {
                        check_required_features(&header)?;
                        if let Some(source) = &header.source {
                            debug!("header source: {source}");
                        }
                        header_seen = true;
                    }
                    Classified::Empty(meta) => {
                        index.blocks.push(meta);
                    }
                    Classified::Ways(meta, max_id) => {
                        let block = index.push_block(meta);
                        index.way_blocks.push((block, max_id));
                    }
                    Classified::DenseNodes(meta, min_id, max_id) => {
                        let block = index.push_block(meta);
                        index.node_blocks.push((block, min_id, max_id));
                    }
                    Classified::Relations(meta, ids) => {
                        let block = index.push_block(meta);
                        for id in ids {
                            index.relation_blocks.insert(id, block);
                        }
                    }
                }
                Ok(garbage)
            },
        )?;

        if !header_seen {
            warn!("{} has no OSMHeader blob", path.display());
        }
        info!(
            "indexed {} blocks: {} way, {} dense-node, {} holding relations",
            index.blocks.len(),
            index.way_blocks.len(),
            index.node_blocks.len(),
            index
                .relation_blocks
                .values()
                .collect::<std::collections::HashSet<_>>()
                .len(),
        );
        Ok(index)
    }

    fn push_block(&mut self, meta: BlockMeta) -> u32 {
        self.blocks.push(meta);
        (self.blocks.len() - 1) as u32
    }

    pub fn block_meta(&self, block: u32) -> Option<BlockMeta> {
        self.blocks.get(block as usize).copied()
    }

    pub fn way_count(&self) -> usize {
        self.way_blocks.len()
    }

    pub fn node_count(&self) -> usize {
        self.node_blocks.len()
    }

    /// Maximum number of linear hint checks that are still cheaper than a
    /// fresh binary search over `len` entries.
    pub fn hint_budget(len: usize) -> usize {
        if len <= 1 {
            0
        } else {
            len.ilog2() as usize
        }
    }

    /// Writes the four sidecar files next to the input file, one delimited
    /// record per line.
    pub fn save(&self, input: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(sidecar_path(input, BLOCKS_SIDECAR))?);
        for (block, meta) in self.blocks.iter().enumerate() {
            writeln!(out, "{}:{}:{}", block, meta.offset, meta.len)?;
        }
        out.flush()?;

        let mut out = BufWriter::new(File::create(sidecar_path(input, WAYS_SIDECAR))?);
        for (block, max_id) in &self.way_blocks {
            writeln!(out, "{block}:{max_id}")?;
        }
        out.flush()?;

        let mut out = BufWriter::new(File::create(sidecar_path(input, NODES_SIDECAR))?);
        for (block, min_id, max_id) in &self.node_blocks {
            writeln!(out, "{block}:{min_id}:{max_id}")?;
        }
        out.flush()?;

        let mut out = BufWriter::new(File::create(sidecar_path(input, RELATIONS_SIDECAR))?);
        for (id, block) in &self.relation_blocks {
            writeln!(out, "{id}:{block}")?;
        }
        out.flush()?;

        debug!("saved index sidecars for {}", input.display());
        Ok(())
    }

    /// Loads a previously saved index. Returns `None` when any sidecar is
    /// absent; a parse failure is a `CorruptSidecar` error, which the caller
    /// recovers from by rebuilding the index.
    pub fn load(input: &Path) -> Result<Option<BlockIndex>> {
        let paths = [
            sidecar_path(input, BLOCKS_SIDECAR),
            sidecar_path(input, WAYS_SIDECAR),
            sidecar_path(input, NODES_SIDECAR),
            sidecar_path(input, RELATIONS_SIDECAR),
        ];
        if !paths.iter().all(|p| p.exists()) {
            return Ok(None);
        }

        let mut index = BlockIndex::default();

        for (block, fields) in read_records(&paths[0], 3)? {
            if block as usize != index.blocks.len() {
                return Err(corrupt(&paths[0], "block numbers are not sequential"));
            }
            index.blocks.push(BlockMeta {
                offset: fields[0] as u64,
                len: fields[1] as u32,
            });
        }
        for (block, fields) in read_records(&paths[1], 2)? {
            index.way_blocks.push((block, fields[0]));
        }
        for (block, fields) in read_records(&paths[2], 3)? {
            index.node_blocks.push((block, fields[0], fields[1]));
        }
        let file = BufReader::new(File::open(&paths[3])?);
        for line in file.lines() {
            let line = line?;
            let (id, block) = line
                .split_once(':')
                .ok_or_else(|| corrupt(&paths[3], "expected id:block"))?;
            let id: i64 = id.parse().map_err(|_| corrupt(&paths[3], "bad id"))?;
            let block: u32 = block.parse().map_err(|_| corrupt(&paths[3], "bad block"))?;
            index.relation_blocks.insert(id, block);
        }

        info!(
            "loaded index sidecars for {} ({} blocks)",
            input.display(),
            index.blocks.len()
        );
        Ok(Some(index))
    }

    /// Deletes the sidecar files; missing ones are ignored.
    pub fn remove_sidecars(input: &Path) {
        for suffix in [
            BLOCKS_SIDECAR,
            WAYS_SIDECAR,
            NODES_SIDECAR,
            RELATIONS_SIDECAR,
        ] {
            let _ = fs::remove_file(sidecar_path(input, suffix));
        }
    }
}

/// Parses `block:field(:field)` lines; the leading key plus `arity - 1`
/// numeric fields.
fn read_records(path: &Path, arity: usize) -> Result<Vec<(u32, Vec<i64>)>> {
    let file = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in file.lines() {
        let line = line?;
        let mut parts = line.split(':');
        let key: u32 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| corrupt(path, "bad record key"))?;
        let fields: Vec<i64> = parts
            .map(|p| p.parse::<i64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| corrupt(path, "bad record field"))?;
        if fields.len() != arity - 1 {
            return Err(corrupt(path, "wrong number of fields"));
        }
        records.push((key, fields));
    }
    Ok(records)
}

fn corrupt(path: &Path, reason: &str) -> Error {
    Error::CorruptSidecar {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn sidecar_path(input: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}.{}", input.display(), suffix))
}

fn check_required_features(header: &osmpbf::HeaderBlock) -> Result<()> {
    for feature in &header.required_features {
        if !SUPPORTED_FEATURES.contains(&feature.as_str()) {
            return Err(Error::UnsupportedBlock(format!(
                "required feature {feature} is not supported"
            )));
        }
    }
    Ok(())
}

fn classify_blob(blob: ScannedBlob) -> Result<(Classified, Option<osmpbf::PrimitiveBlock>)> {
    let meta = BlockMeta {
        offset: blob.offset,
        len: blob.len,
    };
    let payload = BlockStore::inflate_blob(&blob.data, blob.offset)?;

    if blob.is_header {
        let header = osmpbf::HeaderBlock::decode(payload.as_slice())?;
        return Ok((Classified::Header(header), None));
    }

    let Some(kind) = BlockType::from_osmdata_blob(&payload)? else {
        return Ok((Classified::Empty(meta), None));
    };
    if kind == BlockType::Nodes {
        return Err(Error::UnsupportedBlock(
            "only dense nodes are supported".into(),
        ));
    }

    let block = osmpbf::PrimitiveBlock::decode(payload.as_slice())?;
    let classified = match kind {
        BlockType::Ways => {
            let max_id = block
                .primitivegroup
                .iter()
                .flat_map(|g| g.ways.iter().map(|w| w.id))
                .max();
            match max_id {
                Some(max_id) => Classified::Ways(meta, max_id),
                None => Classified::Empty(meta),
            }
        }
        BlockType::DenseNodes => {
            let mut min_id = i64::MAX;
            let mut max_id = i64::MIN;
            for group in &block.primitivegroup {
                let Some(dense) = &group.dense else { continue };
                let mut id = 0;
                for delta in &dense.id {
                    id += delta;
                    min_id = min_id.min(id);
                    max_id = max_id.max(id);
                }
            }
            if min_id > max_id {
                Classified::Empty(meta)
            } else {
                Classified::DenseNodes(meta, min_id, max_id)
            }
        }
        BlockType::Relations => {
            let ids = block
                .primitivegroup
                .iter()
                .flat_map(|g| g.relations.iter().map(|r| r.id))
                .collect();
            Classified::Relations(meta, ids)
        }
        BlockType::Nodes => unreachable!(),
    };
    Ok((classified, Some(block)))
}

/// Sequential walk over the length-prefixed blob records of a pbf file.
struct BlobScanner {
    reader: BufReader<File>,
    offset: u64,
}

struct ScannedBlob {
    is_header: bool,
    offset: u64,
    len: u32,
    data: Vec<u8>,
}

impl BlobScanner {
    fn open(path: &Path) -> Result<Self> {
        Ok(BlobScanner {
            reader: BufReader::new(File::open(path)?),
            offset: 0,
        })
    }

    fn next_blob(&mut self) -> Result<Option<ScannedBlob>> {
        let mut len_buf = [0u8; 4];
        if !read_exact_or_eof(&mut self.reader, &mut len_buf)? {
            return Ok(None);
        }
        let header_len = NetworkEndian::read_i32(&len_buf);

        let mut header_buf = vec![0u8; header_len as usize];
        self.reader.read_exact(&mut header_buf)?;
        let header = osmpbf::BlobHeader::decode(header_buf.as_slice())?;
        self.offset += 4 + header_len as u64;

        let offset = self.offset;
        let len = header.datasize as u32;
        let mut data = vec![0u8; len as usize];
        self.reader.read_exact(&mut data)?;
        self.offset += len as u64;

        let is_header = match header.r#type.as_str() {
            "OSMHeader" => true,
            "OSMData" => false,
            other => {
                return Err(Error::UnsupportedBlock(format!(
                    "unknown blob type {other}"
                )));
            }
        };
        Ok(Some(ScannedBlob {
            is_header,
            offset,
            len,
            data,
        }))
    }
}

impl Iterator for BlobScanner {
    type Item = Result<ScannedBlob>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_blob().transpose()
    }
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated blob record",
            )
            .into());
        }
        filled += n;
    }
    Ok(true)
}

/// Last fully processed block of the main pass, persisted after every block.
/// Blocks are walked in strictly decreasing order, so on resume everything
/// at or above the marker is skipped.
pub struct ProgressMarker {
    path: PathBuf,
}

impl ProgressMarker {
    /// Marker value meaning the whole main pass finished.
    pub const MAIN_PASS_DONE: i64 = -1;

    pub fn new(input: &Path) -> Self {
        ProgressMarker {
            path: sidecar_path(input, PROGRESS_SIDECAR),
        }
    }

    /// Reads the marker; an absent or unparsable file means a fresh run.
    pub fn read(&self) -> Option<i64> {
        let text = fs::read_to_string(&self.path).ok()?;
        match text.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("ignoring corrupt progress marker {}", self.path.display());
                None
            }
        }
    }

    pub fn write(&self, block: i64) -> Result<()> {
        fs::write(&self.path, format!("{block}\n"))?;
        Ok(())
    }

    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hint_budget_is_log2() {
        assert_eq!(BlockIndex::hint_budget(0), 0);
        assert_eq!(BlockIndex::hint_budget(1), 0);
        assert_eq!(BlockIndex::hint_budget(2), 1);
        assert_eq!(BlockIndex::hint_budget(9), 3);
        assert_eq!(BlockIndex::hint_budget(1024), 10);
    }

    fn sample_index() -> BlockIndex {
        let mut relation_blocks = AHashMap::new();
        relation_blocks.insert(9000, 4);
        relation_blocks.insert(17, 4);
        BlockIndex {
            blocks: (0..5)
                .map(|i| BlockMeta {
                    offset: 100 * i + 16,
                    len: 80,
                })
                .collect(),
            way_blocks: vec![(3, 500)],
            node_blocks: vec![(0, 1, 100), (1, 101, 200), (2, 201, 300)],
            relation_blocks,
        }
    }

    #[test]
    fn sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("extract.osm.pbf");
        let index = sample_index();
        index.save(&input).unwrap();

        let loaded = BlockIndex::load(&input).unwrap().unwrap();
        assert_eq!(loaded, index);

        BlockIndex::remove_sidecars(&input);
        assert!(BlockIndex::load(&input).unwrap().is_none());
    }

    #[test]
    fn corrupt_sidecar_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("extract.osm.pbf");
        sample_index().save(&input).unwrap();
        fs::write(sidecar_path(&input, WAYS_SIDECAR), "not-a-record\n").unwrap();

        assert!(matches!(
            BlockIndex::load(&input),
            Err(Error::CorruptSidecar { .. })
        ));
    }

    #[test]
    fn progress_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("extract.osm.pbf");
        let marker = ProgressMarker::new(&input);
        assert_eq!(marker.read(), None);

        marker.write(42).unwrap();
        assert_eq!(marker.read(), Some(42));
        marker.write(ProgressMarker::MAIN_PASS_DONE).unwrap();
        assert_eq!(marker.read(), Some(ProgressMarker::MAIN_PASS_DONE));

        marker.clear();
        assert_eq!(marker.read(), None);
    }
}
