//! Turns raw decoded primitives into fully resolved elements: ways get
//! their node coordinates attached, relations get their member ways
//! resolved. Expected failures (missing references, malformed tag tables)
//! are per-element outcomes, not errors; the session aggregates them into a
//! per-block result.

use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use log::{debug, warn};

use crate::element::{BoundingBox, Node, Relation, RelationMember, Tag, Tags, Way};
use crate::index::BlockIndex;
use crate::locator::Locator;
use crate::osmpbf::{self, relation::MemberType};
use crate::sink::StyleClassifier;
use crate::store::BlockStore;
use crate::Result;

/// Per-element outcome. Only block or file level failures surface as `Err`
/// from the assembler; everything expected is a value.
#[derive(Debug)]
pub enum Assembled<T> {
    Resolved(T),
    /// Deliberately not emitted: unmatched style, or a relation without
    /// ring-role members.
    Skipped,
    /// Resolution failed (missing reference, malformed tag table); logged
    /// and dropped.
    Dropped,
}

pub struct Assembler<'a> {
    store: &'a BlockStore,
    index: &'a BlockIndex,
    locator: &'a Locator<'a>,
    classifier: &'a dyn StyleClassifier,
    only_matched: bool,
    bbox: Option<BoundingBox>,
}

impl<'a> Assembler<'a> {
    pub fn new(
        store: &'a BlockStore,
        index: &'a BlockIndex,
        locator: &'a Locator<'a>,
        classifier: &'a dyn StyleClassifier,
        only_matched: bool,
        bbox: Option<BoundingBox>,
    ) -> Self {
        Assembler {
            store,
            index,
            locator,
            classifier,
            only_matched,
            bbox,
        }
    }

    /// Resolves a raw way into a way with coordinates attached to every
    /// node reference, in original order.
    pub fn resolve_way(
        &self,
        raw: &osmpbf::Way,
        strings: &osmpbf::StringTable,
    ) -> Result<Assembled<Way>> {
        self.resolve_way_inner(raw, strings, false)
    }

    fn resolve_way_inner(
        &self,
        raw: &osmpbf::Way,
        strings: &osmpbf::StringTable,
        in_relation: bool,
    ) -> Result<Assembled<Way>> {
        let tags = match decode_tags(&raw.keys, &raw.vals, strings) {
            Ok(tags) => tags,
            Err(reason) => {
                warn!("way {}: dropped, {reason}", raw.id);
                return Ok(Assembled::Dropped);
            }
        };
        let tags = self.classifier.filter_tags(tags);
        // Ways nested in a relation are resolved even when individually
        // unmatched; the relation's own tags decide inclusion.
        if self.only_matched && !in_relation && self.classifier.classify(&tags).is_none() {
            return Ok(Assembled::Skipped);
        }

        let mut node_ids = Vec::with_capacity(raw.refs.len());
        let mut id = 0;
        for delta in &raw.refs {
            id += delta;
            node_ids.push(id);
        }

        // Consecutive way nodes are usually co-located, so blocks seen so
        // far serve as hints for the next lookup.
        let mut hints: Vec<u32> = Vec::new();
        let mut located = Vec::with_capacity(node_ids.len());
        for &node_id in &node_ids {
            let block = match self.locator.find_node_block(node_id, &hints) {
                Ok(block) => block,
                Err(e) if e.is_element_error() => {
                    warn!("way {}: dropped, {e}", raw.id);
                    return Ok(Assembled::Dropped);
                }
                Err(e) => return Err(e),
            };
            remember_hint(&mut hints, block);
            located.push((block, node_id));
        }

        let coords = self.fetch_coords(located)?;

        let mut nodes = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            match coords.get(&node_id) {
                Some(&(lat, lon)) => nodes.push(Node {
                    id: node_id,
                    lat,
                    lon,
                    tags: Tags::new(),
                }),
                None => {
                    warn!("way {}: dropped, node {node_id} absent from its block", raw.id);
                    return Ok(Assembled::Dropped);
                }
            }
        }

        Ok(Assembled::Resolved(Way {
            id: raw.id,
            tags,
            nodes,
        }))
    }

    /// Fetches every distinct block exactly once and pulls the wanted
    /// coordinates out of it.
    fn fetch_coords(&self, located: Vec<(u32, i64)>) -> Result<AHashMap<i64, (f64, f64)>> {
        let mut coords = AHashMap::with_capacity(located.len());
        for (block, ids) in located.into_iter().into_group_map() {
            let decoded = self
                .store
                .get_or_load(block, self.index)
                .map_err(|e| e.in_block(block))?;
            collect_dense_coords(&decoded, &ids, &mut coords);
        }
        Ok(coords)
    }

    /// Resolves a raw relation into a relation whose way members carry full
    /// geometry. Members referencing missing ways are dropped individually;
    /// the relation survives as long as at least one ring-role member
    /// resolves.
    pub fn resolve_relation(
        &self,
        raw: &osmpbf::Relation,
        strings: &osmpbf::StringTable,
    ) -> Result<Assembled<Relation>> {
        if raw.roles_sid.len() != raw.memids.len() || raw.memids.len() != raw.types.len() {
            warn!("relation {}: dropped, malformed member arrays", raw.id);
            return Ok(Assembled::Dropped);
        }

        let mut members = Vec::with_capacity(raw.memids.len());
        let mut member_id = 0;
        for i in 0..raw.memids.len() {
            member_id += raw.memids[i];
            let Ok(member_type) = MemberType::try_from(raw.types[i]) else {
                warn!("relation {}: dropped, unknown member type", raw.id);
                return Ok(Assembled::Dropped);
            };
            let role = match strings.get(raw.roles_sid[i] as usize) {
                Ok(role) => role,
                Err(e) => {
                    warn!("relation {}: dropped, {e}", raw.id);
                    return Ok(Assembled::Dropped);
                }
            };
            members.push((member_type, member_id, role));
        }

        // Relations without ring-role way members are not areas; reject
        // before any member resolution work is spent.
        let has_ring = members
            .iter()
            .any(|(t, _, role)| *t == MemberType::Way && (*role == "inner" || *role == "outer"));
        if !has_ring {
            debug!("relation {}: no ring-role members, skipped", raw.id);
            return Ok(Assembled::Skipped);
        }

        let tags = match decode_tags(&raw.keys, &raw.vals, strings) {
            Ok(tags) => tags,
            Err(reason) => {
                warn!("relation {}: dropped, {reason}", raw.id);
                return Ok(Assembled::Dropped);
            }
        };
        let tags = self.classifier.filter_tags(tags);
        if self.only_matched && self.classifier.classify(&tags).is_none() {
            return Ok(Assembled::Skipped);
        }

        // The same way may be referenced more than once; resolve it once.
        let mut resolved: AHashMap<i64, Option<Way>> = AHashMap::new();
        let mut hints: Vec<u32> = Vec::new();
        let mut out_members = Vec::new();
        for (member_type, member_id, role) in members {
            match member_type {
                // node members are not needed for area geometry
                MemberType::Node => continue,
                MemberType::Relation => {
                    debug!(
                        "relation {}: skipping nested relation member {member_id}",
                        raw.id
                    );
                    continue;
                }
                MemberType::Way => {}
            }

            let way = match resolved.get(&member_id) {
                Some(cached) => cached.clone(),
                None => {
                    let way = self.resolve_member_way(raw.id, member_id, &mut hints)?;
                    resolved.insert(member_id, way.clone());
                    way
                }
            };
            if let Some(way) = way {
                out_members.push(RelationMember {
                    role: role.to_string(),
                    way,
                });
            }
        }

        if !out_members.iter().any(RelationMember::is_ring) {
            warn!("relation {}: dropped, no resolvable ring members", raw.id);
            return Ok(Assembled::Dropped);
        }

        Ok(Assembled::Resolved(Relation {
            id: raw.id,
            tags,
            members: out_members,
        }))
    }

    fn resolve_member_way(
        &self,
        relation_id: i64,
        way_id: i64,
        hints: &mut Vec<u32>,
    ) -> Result<Option<Way>> {
        let block = match self.locator.find_way_block(way_id, hints) {
            Ok(block) => block,
            Err(e) if e.is_element_error() => {
                warn!("relation {relation_id}: member way {way_id} unresolvable, {e}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        remember_hint(hints, block);

        let decoded = self
            .store
            .get_or_load(block, self.index)
            .map_err(|e| e.in_block(block))?;
        let raw_way = decoded
            .primitivegroup
            .iter()
            .flat_map(|g| g.ways.iter())
            .find(|w| w.id == way_id);
        let Some(raw_way) = raw_way else {
            warn!("relation {relation_id}: member way {way_id} absent from block {block}");
            return Ok(None);
        };

        match self.resolve_way_inner(raw_way, &decoded.stringtable, true)? {
            Assembled::Resolved(way) => Ok(Some(way)),
            _ => Ok(None),
        }
    }

    /// Pulls the tagged nodes out of a dense-node block. Only ~2% of nodes
    /// carry tags; the scan stops as soon as the key/value table is
    /// exhausted, since every later node is untagged.
    pub fn extract_tagged_nodes(&self, block: &osmpbf::PrimitiveBlock) -> Vec<Node> {
        let (granularity, lat_offset, lon_offset) = block.coord_params();
        let strings = &block.stringtable;
        let mut out = Vec::new();

        for group in &block.primitivegroup {
            let Some(dense) = &group.dense else { continue };
            let keys_vals = &dense.keys_vals;
            let mut cursor = 0;
            let (mut id, mut lat, mut lon) = (0i64, 0i64, 0i64);

            for i in 0..dense.id.len() {
                if cursor >= keys_vals.len() {
                    break;
                }
                id += dense.id[i];
                lat += dense.lat[i];
                lon += dense.lon[i];

                if keys_vals[cursor] == 0 {
                    // untagged, the common case
                    cursor += 1;
                    continue;
                }

                let mut tags = Tags::new();
                let mut malformed = false;
                while cursor < keys_vals.len() && keys_vals[cursor] != 0 {
                    let key = strings.get(keys_vals[cursor] as usize);
                    let value = keys_vals
                        .get(cursor + 1)
                        .map(|&v| strings.get(v as usize));
                    cursor += 2;
                    match (key, value) {
                        (Ok(key), Some(Ok(value))) => tags.push(Tag::new(key, value)),
                        _ => malformed = true,
                    }
                }
                cursor += 1; // separator

                if malformed {
                    warn!("node {id}: dropped, malformed tag table");
                    continue;
                }

                let lat_deg = 1e-9 * (lat_offset + granularity * lat) as f64;
                let lon_deg = 1e-9 * (lon_offset + granularity * lon) as f64;
                if let Some(bbox) = &self.bbox {
                    if !bbox.contains(lat_deg, lon_deg) {
                        continue;
                    }
                }

                let tags = self.classifier.filter_tags(tags);
                if self.only_matched && self.classifier.classify(&tags).is_none() {
                    continue;
                }

                out.push(Node {
                    id,
                    lat: lat_deg,
                    lon: lon_deg,
                    tags,
                });
            }
        }
        out
    }
}

/// Keeps the most recently confirmed block in front so it is tried first.
fn remember_hint(hints: &mut Vec<u32>, block: u32) {
    if hints.first() != Some(&block) {
        hints.retain(|&b| b != block);
        hints.insert(0, block);
    }
}

fn decode_tags(
    keys: &[u32],
    vals: &[u32],
    strings: &osmpbf::StringTable,
) -> std::result::Result<Tags, String> {
    if keys.len() != vals.len() {
        return Err("mismatched key/value arrays".to_string());
    }
    keys.iter()
        .zip(vals)
        .map(|(&k, &v)| {
            let key = strings.get(k as usize).map_err(|e| e.to_string())?;
            let value = strings.get(v as usize).map_err(|e| e.to_string())?;
            Ok(Tag::new(key, value))
        })
        .collect()
}

fn collect_dense_coords(
    block: &osmpbf::PrimitiveBlock,
    wanted: &[i64],
    out: &mut AHashMap<i64, (f64, f64)>,
) {
    let wanted: AHashSet<i64> = wanted.iter().copied().collect();
    let (granularity, lat_offset, lon_offset) = block.coord_params();
    let mut found = 0;

    for group in &block.primitivegroup {
        let Some(dense) = &group.dense else { continue };
        let (mut id, mut lat, mut lon) = (0i64, 0i64, 0i64);
        for i in 0..dense.id.len() {
            id += dense.id[i];
            lat += dense.lat[i];
            lon += dense.lon[i];
            if wanted.contains(&id) {
                out.insert(
                    id,
                    (
                        1e-9 * (lat_offset + granularity * lat) as f64,
                        1e-9 * (lon_offset + granularity * lon) as f64,
                    ),
                );
                found += 1;
                if found == wanted.len() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::osmpbf::{DenseNodes, PrimitiveBlock, PrimitiveGroup, StringTable};

    fn dense_block(nodes: &[(i64, f64, f64)]) -> PrimitiveBlock {
        let mut dense = DenseNodes::default();
        let (mut prev_id, mut prev_lat, mut prev_lon) = (0i64, 0i64, 0i64);
        for &(id, lat, lon) in nodes {
            let lat = (lat * 1e7) as i64;
            let lon = (lon * 1e7) as i64;
            dense.id.push(id - prev_id);
            dense.lat.push(lat - prev_lat);
            dense.lon.push(lon - prev_lon);
            (prev_id, prev_lat, prev_lon) = (id, lat, lon);
        }
        PrimitiveBlock {
            stringtable: StringTable::default(),
            primitivegroup: vec![PrimitiveGroup {
                dense: Some(dense),
                ..Default::default()
            }],
            granularity: Some(100),
            lat_offset: Some(0),
            lon_offset: Some(0),
        }
    }

    #[test]
    fn collects_only_wanted_coords() {
        let block = dense_block(&[(1, 10.0, 20.0), (2, 10.5, 20.5), (3, 11.0, 21.0)]);
        let mut coords = AHashMap::new();
        collect_dense_coords(&block, &[1, 3], &mut coords);

        assert_eq!(coords.len(), 2);
        let (lat, lon) = coords[&1];
        assert!((lat - 10.0).abs() < 1e-6 && (lon - 20.0).abs() < 1e-6);
        let (lat, lon) = coords[&3];
        assert!((lat - 11.0).abs() < 1e-6 && (lon - 21.0).abs() < 1e-6);
        assert!(!coords.contains_key(&2));
    }

    #[test]
    fn decode_tags_resolves_string_indices() {
        let strings = StringTable {
            s: vec![b"".to_vec(), b"highway".to_vec(), b"primary".to_vec()],
        };
        let tags = decode_tags(&[1], &[2], &strings).unwrap();
        assert_eq!(tags, vec![Tag::new("highway", "primary")]);

        assert!(decode_tags(&[1, 2], &[2], &strings).is_err());
        assert!(decode_tags(&[7], &[2], &strings).is_err());
    }

    #[test]
    fn hint_list_keeps_most_recent_first() {
        let mut hints = Vec::new();
        remember_hint(&mut hints, 4);
        remember_hint(&mut hints, 7);
        remember_hint(&mut hints, 7);
        remember_hint(&mut hints, 4);
        assert_eq!(hints, vec![4, 7]);
    }
}
