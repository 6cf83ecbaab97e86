//! Decoded elements handed to the output sink. Immutable once constructed;
//! a way's node list and a relation's member list are fully resolved before
//! handoff.

use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Tag {
            key: key.into(),
            value: value.into(),
        }
    }
}

pub type Tags = Vec<Tag>;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: i64,
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Way {
    pub id: i64,
    pub tags: Tags,
    /// Referenced nodes with resolved coordinates, in original order.
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationMember {
    pub role: String,
    pub way: Way,
}

impl RelationMember {
    pub fn is_ring(&self) -> bool {
        self.role == "inner" || self.role == "outer"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub id: i64,
    pub tags: Tags,
    /// Resolved way members; node members are not needed for area geometry
    /// and are never resolved.
    pub members: Vec<RelationMember>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

impl Element {
    pub fn id(&self) -> i64 {
        match self {
            Element::Node(n) => n.id,
            Element::Way(w) => w.id,
            Element::Relation(r) => r.id,
        }
    }
}

/// Geographic region restricting the output, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lon >= self.left && lon <= self.right && lat >= self.bottom && lat <= self.top
    }
}

impl FromStr for BoundingBox {
    type Err = String;

    /// Parses `left,bottom,right,top`.
    fn from_str(s: &str) -> Result<Self, String> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| format!("invalid bounding box `{s}`: {e}"))?;
        if parts.len() != 4 {
            return Err(format!(
                "invalid bounding box `{s}`: expected left,bottom,right,top"
            ));
        }
        Ok(BoundingBox {
            left: parts[0],
            bottom: parts[1],
            right: parts[2],
            top: parts[3],
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bbox_parse_and_contains() {
        let bbox: BoundingBox = "-1.5,50.0,0.5,51.0".parse().unwrap();
        assert!(bbox.contains(50.5, 0.0));
        assert!(!bbox.contains(49.9, 0.0));
        assert!(!bbox.contains(50.5, 1.0));
        assert!("1,2,3".parse::<BoundingBox>().is_err());
        assert!("a,b,c,d".parse::<BoundingBox>().is_err());
    }
}
