//! Collaborator seams: the sink receiving finished elements and the style
//! matcher used for the optional "only emit matched elements" filtering.
//! Geometry interpretation and persistence live behind these traits and are
//! not part of this crate.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::error;
use parking_lot::Mutex;

use crate::element::{Element, Tag, Tags};
use crate::Result;

/// Receives finished elements. Called concurrently from the resolution
/// tasks of a single block's dispatch, hence `Sync`.
pub trait ElementSink: Sync {
    fn accept(&self, element: Element);
}

/// External style matching. `classify` returns the matched style name, or
/// `None` when only the default/fallback style applies; such elements are
/// dropped in "only matched" mode before any resolution work is spent on
/// them.
pub trait StyleClassifier: Sync {
    fn classify(&self, tags: &[Tag]) -> Option<String>;

    /// Strips tags irrelevant for rendering before an element is built.
    fn filter_tags(&self, tags: Tags) -> Tags {
        tags
    }
}

/// Classifier that matches everything. The default when no style rules are
/// wired in.
pub struct AcceptAll;

impl StyleClassifier for AcceptAll {
    fn classify(&self, _tags: &[Tag]) -> Option<String> {
        Some("default".to_string())
    }
}

/// Matches elements carrying at least one of a fixed set of keys, named
/// after the key. A stand-in for a real style sheet.
pub struct KeyListClassifier {
    keys: Vec<String>,
}

impl KeyListClassifier {
    pub fn new(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        KeyListClassifier {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for KeyListClassifier {
    fn default() -> Self {
        KeyListClassifier::new([
            "building", "highway", "landuse", "leisure", "natural", "water", "waterway",
        ])
    }
}

impl StyleClassifier for KeyListClassifier {
    fn classify(&self, tags: &[Tag]) -> Option<String> {
        tags.iter()
            .find(|t| self.keys.iter().any(|k| k == &t.key))
            .map(|t| t.key.clone())
    }
}

/// Collects everything in memory. Used by tests and small extracts.
#[derive(Default)]
pub struct CollectingSink {
    elements: Mutex<Vec<Element>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_elements(self) -> Vec<Element> {
        self.elements.into_inner()
    }

    pub fn len(&self) -> usize {
        self.elements.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.lock().is_empty()
    }
}

impl ElementSink for CollectingSink {
    fn accept(&self, element: Element) {
        self.elements.lock().push(element);
    }
}

/// Writes one line per element, for inspection of an extraction run.
pub struct LineFileSink {
    out: Mutex<BufWriter<File>>,
}

impl LineFileSink {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(LineFileSink {
            out: Mutex::new(BufWriter::new(File::create(path)?)),
        })
    }
}

impl ElementSink for LineFileSink {
    fn accept(&self, element: Element) {
        let line = match &element {
            Element::Node(n) => {
                format!("node {} {:.7} {:.7} tags={}", n.id, n.lat, n.lon, n.tags.len())
            }
            Element::Way(w) => {
                format!("way {} nodes={} tags={}", w.id, w.nodes.len(), w.tags.len())
            }
            Element::Relation(r) => format!(
                "relation {} members={} tags={}",
                r.id,
                r.members.len(),
                r.tags.len()
            ),
        };
        let mut out = self.out.lock();
        if let Err(e) = writeln!(out, "{line}") {
            error!("failed to write element {}: {}", element.id(), e);
        }
    }
}

impl Drop for LineFileSink {
    fn drop(&mut self) {
        if let Err(e) = self.out.lock().flush() {
            error!("failed to flush element output: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_list_classifier_matches_on_key() {
        let classifier = KeyListClassifier::default();
        let matched = vec![Tag::new("building", "yes"), Tag::new("name", "x")];
        assert_eq!(classifier.classify(&matched).as_deref(), Some("building"));

        let unmatched = vec![Tag::new("name", "x")];
        assert_eq!(classifier.classify(&unmatched), None);
    }
}
