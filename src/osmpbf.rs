//! OSM pbf wire schema and cheap block classification.
//!
//! The message structs below mirror the subset of `fileformat.proto` and
//! `osmformat.proto` this crate reads (metadata/info fields are skipped by
//! prost on decode). They are checked in instead of generated at build time.

use prost::encoding::{decode_key, decode_varint, skip_field, DecodeContext};

use crate::{Error, Result};

#[derive(Clone, PartialEq, prost::Message)]
pub struct BlobHeader {
    #[prost(string, required, tag = "1")]
    pub r#type: String,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub indexdata: Option<Vec<u8>>,
    #[prost(int32, required, tag = "3")]
    pub datasize: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Blob {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub raw: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "2")]
    pub raw_size: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub zlib_data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HeaderBlock {
    #[prost(message, optional, tag = "1")]
    pub bbox: Option<HeaderBBox>,
    #[prost(string, repeated, tag = "4")]
    pub required_features: Vec<String>,
    #[prost(string, repeated, tag = "5")]
    pub optional_features: Vec<String>,
    #[prost(string, optional, tag = "16")]
    pub writingprogram: Option<String>,
    #[prost(string, optional, tag = "17")]
    pub source: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HeaderBBox {
    #[prost(sint64, required, tag = "1")]
    pub left: i64,
    #[prost(sint64, required, tag = "2")]
    pub right: i64,
    #[prost(sint64, required, tag = "3")]
    pub top: i64,
    #[prost(sint64, required, tag = "4")]
    pub bottom: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PrimitiveBlock {
    #[prost(message, required, tag = "1")]
    pub stringtable: StringTable,
    #[prost(message, repeated, tag = "2")]
    pub primitivegroup: Vec<PrimitiveGroup>,
    /// Granularity of lat/lon values in nanodegrees.
    #[prost(int32, optional, tag = "17", default = "100")]
    pub granularity: Option<i32>,
    #[prost(int64, optional, tag = "19", default = "0")]
    pub lat_offset: Option<i64>,
    #[prost(int64, optional, tag = "20", default = "0")]
    pub lon_offset: Option<i64>,
}

impl PrimitiveBlock {
    /// `(granularity, lat_offset, lon_offset)` with proto defaults applied.
    pub fn coord_params(&self) -> (i64, i64, i64) {
        (
            self.granularity.unwrap_or(100) as i64,
            self.lat_offset.unwrap_or(0),
            self.lon_offset.unwrap_or(0),
        )
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StringTable {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub s: Vec<Vec<u8>>,
}

impl StringTable {
    /// Resolves a string table index into UTF-8 text.
    pub fn get(&self, idx: usize) -> Result<&str> {
        let raw = self
            .s
            .get(idx)
            .ok_or_else(|| Error::Decode(prost::DecodeError::new("string table index out of range")))?;
        Ok(std::str::from_utf8(raw)?)
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PrimitiveGroup {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<Node>,
    #[prost(message, optional, tag = "2")]
    pub dense: Option<DenseNodes>,
    #[prost(message, repeated, tag = "3")]
    pub ways: Vec<Way>,
    #[prost(message, repeated, tag = "4")]
    pub relations: Vec<Relation>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Node {
    #[prost(sint64, required, tag = "1")]
    pub id: i64,
    #[prost(uint32, repeated, tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub vals: Vec<u32>,
    #[prost(sint64, required, tag = "8")]
    pub lat: i64,
    #[prost(sint64, required, tag = "9")]
    pub lon: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DenseNodes {
    /// Delta-encoded node ids.
    #[prost(sint64, repeated, tag = "1")]
    pub id: Vec<i64>,
    /// Delta-encoded latitudes in units of granularity.
    #[prost(sint64, repeated, tag = "8")]
    pub lat: Vec<i64>,
    #[prost(sint64, repeated, tag = "9")]
    pub lon: Vec<i64>,
    /// Interleaved key/value string indices, one 0-terminated run per node.
    #[prost(int32, repeated, tag = "10")]
    pub keys_vals: Vec<i32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Way {
    #[prost(int64, required, tag = "1")]
    pub id: i64,
    #[prost(uint32, repeated, tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub vals: Vec<u32>,
    /// Delta-encoded node references.
    #[prost(sint64, repeated, tag = "8")]
    pub refs: Vec<i64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Relation {
    #[prost(int64, required, tag = "1")]
    pub id: i64,
    #[prost(uint32, repeated, tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub vals: Vec<u32>,
    #[prost(int32, repeated, tag = "8")]
    pub roles_sid: Vec<i32>,
    /// Delta-encoded member ids.
    #[prost(sint64, repeated, tag = "9")]
    pub memids: Vec<i64>,
    #[prost(enumeration = "relation::MemberType", repeated, tag = "10")]
    pub types: Vec<i32>,
}

pub mod relation {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum MemberType {
        Node = 0,
        Way = 1,
        Relation = 2,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockType {
    Nodes,
    DenseNodes,
    Ways,
    Relations,
}

impl BlockType {
    /// Decode block type from PrimitiveBlock protobuf message.
    ///
    /// This does not decode any fields, it just checks which tags are present
    /// in the PrimitiveGroup fields of the message. All groups are scanned so
    /// that a block mixing element kinds is rejected instead of misindexed.
    ///
    /// `blob` should contain decompressed data of an OSMData PrimitiveBlock.
    ///
    /// Note: We use public API of `prost` crate, which though is not exposed
    /// in the crate and marked with comment that it should be only used from
    /// `prost::Message`.
    pub fn from_osmdata_blob(mut blob: &[u8]) -> Result<Option<BlockType>> {
        const PRIMITIVE_GROUP_TAG: u32 = 2;
        const NODES_TAG: u32 = 1;
        const DENSE_NODES_TAG: u32 = 2;
        const WAYS_TAG: u32 = 3;
        const RELATIONS_TAG: u32 = 4;
        const CHANGESETS_TAG: u32 = 5;

        let mut found: Option<BlockType> = None;
        while !blob.is_empty() {
            // decode fields of PrimitiveBlock
            let (key, wire_type) = decode_key(&mut blob)?;
            if key != PRIMITIVE_GROUP_TAG {
                skip_field(wire_type, key, &mut blob, DecodeContext::default())?;
                continue;
            }

            // walk every field of this PrimitiveGroup
            let len = decode_varint(&mut blob)? as usize;
            if len > blob.len() {
                return Err(prost::DecodeError::new("truncated primitive group").into());
            }
            let (mut group, rest) = blob.split_at(len);
            blob = rest;

            while !group.is_empty() {
                let (tag, wire_type) = decode_key(&mut group)?;
                let block_type = match tag {
                    NODES_TAG => BlockType::Nodes,
                    DENSE_NODES_TAG => BlockType::DenseNodes,
                    WAYS_TAG => BlockType::Ways,
                    RELATIONS_TAG => BlockType::Relations,
                    CHANGESETS_TAG => {
                        return Err(Error::UnsupportedBlock(
                            "block contains changesets".into(),
                        ));
                    }
                    _ => {
                        return Err(prost::DecodeError::new("malformed primitive block").into());
                    }
                };
                match found {
                    None => found = Some(block_type),
                    Some(seen) if seen != block_type => return Err(Error::MixedBlock),
                    Some(_) => {}
                }
                skip_field(wire_type, tag, &mut group, DecodeContext::default())?;
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use prost::Message;

    fn encoded(block: &PrimitiveBlock) -> Vec<u8> {
        block.encode_to_vec()
    }

    #[test]
    fn classifies_pure_blocks() {
        let mut block = PrimitiveBlock::default();
        block.primitivegroup.push(PrimitiveGroup {
            ways: vec![Way {
                id: 7,
                ..Default::default()
            }],
            ..Default::default()
        });
        assert_eq!(
            BlockType::from_osmdata_blob(&encoded(&block)).unwrap(),
            Some(BlockType::Ways)
        );

        let mut block = PrimitiveBlock::default();
        block.primitivegroup.push(PrimitiveGroup {
            dense: Some(DenseNodes {
                id: vec![1],
                lat: vec![0],
                lon: vec![0],
                keys_vals: vec![],
            }),
            ..Default::default()
        });
        assert_eq!(
            BlockType::from_osmdata_blob(&encoded(&block)).unwrap(),
            Some(BlockType::DenseNodes)
        );
    }

    #[test]
    fn empty_block_has_no_type() {
        let block = PrimitiveBlock::default();
        assert_eq!(BlockType::from_osmdata_blob(&encoded(&block)).unwrap(), None);
    }

    #[test]
    fn mixed_block_is_rejected() {
        let mut block = PrimitiveBlock::default();
        block.primitivegroup.push(PrimitiveGroup {
            ways: vec![Way {
                id: 7,
                ..Default::default()
            }],
            relations: vec![Relation {
                id: 9,
                ..Default::default()
            }],
            ..Default::default()
        });
        assert!(matches!(
            BlockType::from_osmdata_blob(&encoded(&block)),
            Err(Error::MixedBlock)
        ));
    }
}
