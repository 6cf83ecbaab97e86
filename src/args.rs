use std::path::PathBuf;

use clap::Parser;

use crate::element::BoundingBox;

/// Extracts nodes, ways and relations from an OSM pbf file as a stream of
/// resolved elements.
#[derive(Debug, Parser)]
#[clap(about, version)]
pub struct Args {
    /// Verbose mode (-v, -vv, -vvv, etc.)
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Input OSM pbf file
    pub input: PathBuf,

    /// Output directory for extracted elements
    pub output: PathBuf,

    /// Emit only elements matched by the style key list
    #[arg(long = "only-matched")]
    pub only_matched: bool,

    /// Disable parallelism and flush per element
    #[arg(long = "low-resource")]
    pub low_resource: bool,

    /// Keep every decoded block cached (trades RAM for speed)
    #[arg(long = "cache-all")]
    pub cache_all: bool,

    /// Retain index sidecar files after completion
    #[arg(long = "keep-index")]
    pub keep_index: bool,

    /// Restrict output to a region, as left,bottom,right,top degrees
    #[arg(long, value_name = "L,B,R,T")]
    pub bbox: Option<BoundingBox>,

    /// Process only this relation and its members
    #[arg(long, value_name = "ID")]
    pub relation: Option<i64>,
}
