//! Random-access reads of pbf blobs and the decoded-block cache.
//!
//! The file offset is shared mutable state, so seek+read runs under a single
//! lock. Decompression and protobuf decoding of the returned bytes happen
//! outside that critical section and may run on any number of threads.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use flate2::read::ZlibDecoder;
use log::debug;
use parking_lot::{Mutex, RwLock};
use prost::Message;

use crate::index::BlockIndex;
use crate::osmpbf;
use crate::{Error, Result};

pub struct BlockStore {
    file: Mutex<File>,
    cache: RwLock<AHashMap<u32, Arc<osmpbf::PrimitiveBlock>>>,
    /// Blocks accessed since the last prune.
    touched: Mutex<AHashSet<u32>>,
    retain_all: bool,
}

impl BlockStore {
    /// Opens the source file for random access. With `retain_all` set, every
    /// decoded block stays cached for the rest of the run, trading RAM for
    /// never re-inflating a block.
    pub fn open(path: &Path, retain_all: bool) -> Result<Self> {
        let file = File::open(path)?;
        Ok(BlockStore {
            file: Mutex::new(file),
            cache: RwLock::new(AHashMap::new()),
            touched: Mutex::new(AHashSet::new()),
            retain_all,
        })
    }

    /// Reads the raw blob bytes at the given file position. Thread-safe;
    /// only the seek+read itself is serialized.
    pub fn read_blob_at(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        Ok(buf)
    }

    /// Inflates a blob into its payload bytes. Pure function of its input.
    pub fn inflate_blob(raw: &[u8], offset: u64) -> Result<Vec<u8>> {
        let blob = osmpbf::Blob::decode(raw)?;

        let payload = if let Some(raw) = blob.raw {
            raw
        } else if let Some(zlib_data) = blob.zlib_data {
            let mut payload = Vec::new();
            let mut decoder = ZlibDecoder::new(&zlib_data[..]);
            decoder.read_to_end(&mut payload)?;
            payload
        } else {
            return Err(Error::UnknownCompression { offset });
        };

        if let Some(raw_size) = blob.raw_size {
            if payload.len() != raw_size as usize {
                return Err(prost::DecodeError::new("blob raw_size mismatch").into());
            }
        }
        Ok(payload)
    }

    /// Decompresses and deserializes a raw blob into a primitive block.
    pub fn decode_block(raw: &[u8], offset: u64) -> Result<osmpbf::PrimitiveBlock> {
        let payload = Self::inflate_blob(raw, offset)?;
        Ok(osmpbf::PrimitiveBlock::decode(payload.as_slice())?)
    }

    /// Returns the cached block or reads, decodes and caches it. The block
    /// is marked as recently accessed either way.
    pub fn get_or_load(
        &self,
        block: u32,
        index: &BlockIndex,
    ) -> Result<Arc<osmpbf::PrimitiveBlock>> {
        self.touched.lock().insert(block);

        if let Some(cached) = self.cache.read().get(&block) {
            return Ok(cached.clone());
        }

        let meta = index.block_meta(block).ok_or(Error::UnknownBlock(block))?;
        let raw = self.read_blob_at(meta.offset, meta.len)?;
        let decoded = Arc::new(Self::decode_block(&raw, meta.offset)?);

        // Another thread may have decoded the same block meanwhile; keep the
        // first entry so both callers share one allocation.
        let mut cache = self.cache.write();
        let entry = cache.entry(block).or_insert_with(|| decoded.clone());
        Ok(entry.clone())
    }

    /// Drops cached blocks that were not accessed since the previous prune.
    /// No-op when the store was opened with `retain_all`.
    pub fn prune_untouched(&self) {
        if self.retain_all {
            return;
        }
        let touched = std::mem::take(&mut *self.touched.lock());
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|block, _| touched.contains(block));
        if before > cache.len() {
            debug!("pruned {} cached blocks", before - cache.len());
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_blocks(&self) -> usize {
        self.cache.read().len()
    }
}
