//! Drives a full extraction pass: index the file (or load a saved index),
//! walk way/relation blocks in strictly decreasing order with parallel
//! per-element resolution, then sweep the dense-node blocks in a fully
//! parallel pass. Progress is persisted after every block so an interrupted
//! run resumes where it stopped; a failing block is retried on a serial
//! fallback path instead of aborting the run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use log::{debug, error, info, warn};
use pbr::ProgressBar;
use rayon::prelude::*;

use crate::assemble::{Assembled, Assembler};
use crate::element::{BoundingBox, Element};
use crate::index::{BlockIndex, ProgressMarker};
use crate::locator::Locator;
use crate::osmpbf;
use crate::sink::{ElementSink, StyleClassifier};
use crate::stats::Stats;
use crate::store::BlockStore;
use crate::{Error, Result};

/// Pause before reprocessing a failed block, giving the allocator a chance
/// to return memory claimed by the parallel attempt.
const FALLBACK_BACKOFF: Duration = Duration::from_millis(500);

/// Immutable run configuration, fixed at session construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source pbf file.
    pub input: PathBuf,
    /// Emit only elements the style classifier matches.
    pub only_matched: bool,
    /// Disable parallelism entirely and flush per element.
    pub low_resource: bool,
    /// Keep every decoded block cached instead of pruning between steps.
    pub cache_all: bool,
    /// Retain index sidecar files after a successful run.
    pub keep_index: bool,
    /// Restrict emitted nodes to this region.
    pub bbox: Option<BoundingBox>,
    /// Process only this relation and its transitive closure.
    pub relation: Option<i64>,
}

impl Config {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Config {
            input: input.into(),
            only_matched: false,
            low_resource: false,
            cache_all: false,
            keep_index: false,
            bbox: None,
            relation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unopened,
    Indexed,
    Processing,
    /// Transient: the block that failed the parallel path; always followed
    /// by a return to `Processing` via the serial fallback.
    Failed(u32),
    Completed,
}

pub struct Session {
    config: Config,
    cancel: Arc<AtomicBool>,
    state: State,
}

impl Session {
    pub fn new(config: Config) -> Self {
        Session {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            state: State::Unopened,
        }
    }

    /// Cooperative cancellation. Setting the flag prevents new blocks from
    /// starting; in-flight block work always runs to completion, and the
    /// sidecars are kept so the run can be resumed.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Runs the whole extraction. Per-element failures drop the element,
    /// per-block failures fall back to serial reprocessing; only file-level
    /// conditions surface as `Err`.
    pub fn run(
        &mut self,
        sink: &dyn ElementSink,
        classifier: &dyn StyleClassifier,
    ) -> Result<Stats> {
        let started = Instant::now();
        let store = BlockStore::open(&self.config.input, self.config.cache_all)?;
        let progress = ProgressMarker::new(&self.config.input);
        let index = self.load_or_build_index(&progress)?;
        self.state = State::Indexed;

        let locator = Locator::new(&index)?;
        let assembler = Assembler::new(
            &store,
            &index,
            &locator,
            classifier,
            self.config.only_matched,
            self.config.bbox,
        );

        if let Some(relation_id) = self.config.relation {
            let stats =
                self.process_single_relation(relation_id, &store, &index, &locator, &assembler, sink)?;
            self.finish(&progress, started);
            return Ok(stats);
        }

        // Way and relation blocks, strictly decreasing: relations reference
        // ways, ways reference nodes in lower-numbered blocks.
        let mut main_blocks: Vec<u32> = index
            .way_blocks
            .iter()
            .map(|&(block, _)| block)
            .chain(index.relation_blocks.values().copied().collect::<AHashSet<_>>())
            .collect();
        main_blocks.sort_unstable();
        main_blocks.dedup();
        main_blocks.reverse();

        match progress.read() {
            Some(ProgressMarker::MAIN_PASS_DONE) => {
                info!("resuming at the node pass");
                main_blocks.clear();
            }
            Some(marker) => {
                info!("resuming below block {marker}");
                main_blocks.retain(|&block| (block as i64) < marker);
            }
            None => {}
        }

        let node_blocks: Vec<u32> = index.node_blocks.iter().map(|&(block, _, _)| block).collect();
        let total = (main_blocks.len() + node_blocks.len()) as u64;
        let processed = Arc::new(AtomicUsize::new(0));
        let monitor_done = Arc::new(AtomicBool::new(false));
        let monitor = spawn_monitor(
            total,
            processed.clone(),
            monitor_done.clone(),
            self.cancel.clone(),
        );

        self.state = State::Processing;
        let outcome = self.run_passes(
            &main_blocks,
            &node_blocks,
            &store,
            &index,
            &assembler,
            sink,
            &progress,
            &processed,
        );
        monitor_done.store(true, Ordering::Relaxed);
        let _ = monitor.join();
        let stats = outcome?;

        if self.cancelled() {
            info!("cancelled; index and progress sidecars kept for resumption");
            return Ok(stats);
        }

        self.state = State::Completed;
        self.finish(&progress, started);
        Ok(stats)
    }

    fn load_or_build_index(&self, progress: &ProgressMarker) -> Result<BlockIndex> {
        match BlockIndex::load(&self.config.input) {
            Ok(Some(index)) => return Ok(index),
            Ok(None) => {}
            Err(e) => {
                warn!("discarding unusable index sidecars: {e}");
                BlockIndex::remove_sidecars(&self.config.input);
            }
        }
        // A marker without its index would resume against wrong block numbers.
        progress.clear();
        let index = BlockIndex::build(&self.config.input)?;
        index.save(&self.config.input)?;
        Ok(index)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_passes(
        &mut self,
        main_blocks: &[u32],
        node_blocks: &[u32],
        store: &BlockStore,
        index: &BlockIndex,
        assembler: &Assembler,
        sink: &dyn ElementSink,
        progress: &ProgressMarker,
        processed: &AtomicUsize,
    ) -> Result<Stats> {
        let mut stats = Stats::default();

        for &block in main_blocks {
            if self.cancelled() {
                return Ok(stats);
            }
            let block_stats =
                match self.process_block(block, store, index, assembler, sink, !self.config.low_resource)
                {
                    Ok(block_stats) => block_stats,
                    Err(e) => {
                        self.state = State::Failed(block);
                        warn!("block {block} failed ({e}); retrying on the serial fallback path");
                        thread::sleep(FALLBACK_BACKOFF);
                        let mut block_stats =
                            match self.process_block(block, store, index, assembler, sink, false) {
                                Ok(block_stats) => block_stats,
                                Err(e) => {
                                    error!("block {block} failed on the fallback path too, dropping it: {e}");
                                    Stats::default()
                                }
                            };
                        block_stats.fallback_blocks += 1;
                        self.state = State::Processing;
                        block_stats
                    }
                };
            stats += block_stats;
            progress.write(block as i64)?;
            store.prune_untouched();
            processed.fetch_add(1, Ordering::Relaxed);
        }
        progress.write(ProgressMarker::MAIN_PASS_DONE)?;

        // The node pass has no inter-block dependency and no ordering
        // guarantee at all.
        let this: &Session = self;
        let node_stats = if self.config.low_resource {
            let mut acc = Stats::default();
            for &block in node_blocks {
                acc += this.process_node_block(block, store, index, assembler, sink, processed);
            }
            acc
        } else {
            node_blocks
                .par_iter()
                .map(|&block| this.process_node_block(block, store, index, assembler, sink, processed))
                .reduce(Stats::default, |mut acc, s| {
                    acc += s;
                    acc
                })
        };
        stats += node_stats;
        Ok(stats)
    }

    /// Processes one way or relation block. Elements are dispatched as
    /// independent units of work; the call returns only after every unit of
    /// this block finished. With `parallel` unset, elements are resolved one
    /// at a time and handed to the sink immediately.
    fn process_block(
        &self,
        block: u32,
        store: &BlockStore,
        index: &BlockIndex,
        assembler: &Assembler,
        sink: &dyn ElementSink,
        parallel: bool,
    ) -> Result<Stats> {
        let decoded = store.get_or_load(block, index).map_err(|e| e.in_block(block))?;
        let strings = &decoded.stringtable;
        let ways: Vec<&osmpbf::Way> = decoded
            .primitivegroup
            .iter()
            .flat_map(|g| g.ways.iter())
            .collect();
        let relations: Vec<&osmpbf::Relation> = decoded
            .primitivegroup
            .iter()
            .flat_map(|g| g.relations.iter())
            .collect();
        debug!(
            "block {block}: {} ways, {} relations",
            ways.len(),
            relations.len()
        );

        let mut stats = Stats::default();
        if parallel {
            stats += ways
                .par_iter()
                .map(|way| -> Result<Stats> {
                    let mut s = Stats::default();
                    record_way(assembler.resolve_way(way, strings)?, sink, &mut s);
                    Ok(s)
                })
                .try_reduce(Stats::default, |mut acc, s| {
                    acc += s;
                    Ok(acc)
                })?;
            stats += relations
                .par_iter()
                .map(|relation| -> Result<Stats> {
                    let mut s = Stats::default();
                    record_relation(assembler.resolve_relation(relation, strings)?, sink, &mut s);
                    Ok(s)
                })
                .try_reduce(Stats::default, |mut acc, s| {
                    acc += s;
                    Ok(acc)
                })?;
        } else {
            for way in &ways {
                record_way(assembler.resolve_way(way, strings)?, sink, &mut stats);
            }
            for relation in &relations {
                record_relation(
                    assembler.resolve_relation(relation, strings)?,
                    sink,
                    &mut stats,
                );
            }
        }
        Ok(stats)
    }

    fn process_node_block(
        &self,
        block: u32,
        store: &BlockStore,
        index: &BlockIndex,
        assembler: &Assembler,
        sink: &dyn ElementSink,
        processed: &AtomicUsize,
    ) -> Stats {
        let mut stats = Stats::default();
        if self.cancelled() {
            return stats;
        }
        match store.get_or_load(block, index) {
            Ok(decoded) => {
                let nodes = assembler.extract_tagged_nodes(&decoded);
                stats.nodes_emitted = nodes.len();
                for node in nodes {
                    sink.accept(Element::Node(node));
                }
            }
            Err(e) => {
                error!("node block {block} unreadable, dropping it: {e}");
                stats.elements_dropped += 1;
            }
        }
        store.prune_untouched();
        processed.fetch_add(1, Ordering::Relaxed);
        stats
    }

    fn process_single_relation(
        &mut self,
        relation_id: i64,
        store: &BlockStore,
        index: &BlockIndex,
        locator: &Locator,
        assembler: &Assembler,
        sink: &dyn ElementSink,
    ) -> Result<Stats> {
        self.state = State::Processing;
        info!("processing only relation {relation_id}");

        let block = locator.find_relation_block(relation_id)?;
        let decoded = store.get_or_load(block, index).map_err(|e| e.in_block(block))?;
        let raw = decoded
            .primitivegroup
            .iter()
            .flat_map(|g| g.relations.iter())
            .find(|r| r.id == relation_id)
            .ok_or(Error::RelationNotFound(relation_id))?;

        let mut stats = Stats::default();
        record_relation(
            assembler.resolve_relation(raw, &decoded.stringtable)?,
            sink,
            &mut stats,
        );
        self.state = State::Completed;
        Ok(stats)
    }

    fn finish(&self, progress: &ProgressMarker, started: Instant) {
        if self.config.keep_index {
            info!("retaining index sidecars for reuse");
        } else {
            BlockIndex::remove_sidecars(&self.config.input);
        }
        progress.clear();
        info!("session completed in {:.2?}", started.elapsed());
    }
}

fn record_way(outcome: Assembled<crate::element::Way>, sink: &dyn ElementSink, stats: &mut Stats) {
    match outcome {
        Assembled::Resolved(way) => {
            sink.accept(Element::Way(way));
            stats.ways_emitted += 1;
        }
        Assembled::Skipped => stats.elements_skipped += 1,
        Assembled::Dropped => stats.elements_dropped += 1,
    }
}

fn record_relation(
    outcome: Assembled<crate::element::Relation>,
    sink: &dyn ElementSink,
    stats: &mut Stats,
) {
    match outcome {
        Assembled::Resolved(relation) => {
            sink.accept(Element::Relation(relation));
            stats.relations_emitted += 1;
        }
        Assembled::Skipped => stats.elements_skipped += 1,
        Assembled::Dropped => stats.elements_dropped += 1,
    }
}

/// Best-effort progress reporting; also announces a pending cancellation.
fn spawn_monitor(
    total: u64,
    processed: Arc<AtomicUsize>,
    done: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut pb = ProgressBar::new(total);
        pb.message("Processing blocks... ");
        let mut cancel_reported = false;
        while !done.load(Ordering::Relaxed) {
            pb.set(processed.load(Ordering::Relaxed) as u64);
            if cancel.load(Ordering::Relaxed) && !cancel_reported {
                info!("cancellation requested; in-flight block work will finish");
                cancel_reported = true;
            }
            thread::sleep(Duration::from_millis(200));
        }
        pb.set(processed.load(Ordering::Relaxed) as u64);
        pb.finish();
    })
}
