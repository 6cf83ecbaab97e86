use std::fs;

use clap::Parser;
use colored::*;

use pbfextract::args::Args;
use pbfextract::{AcceptAll, Config, KeyListClassifier, LineFileSink, Session, StyleClassifier};

type Error = Box<dyn std::error::Error>;

fn run(args: Args) -> Result<(), Error> {
    let config = Config {
        input: args.input,
        only_matched: args.only_matched,
        low_resource: args.low_resource,
        cache_all: args.cache_all,
        keep_index: args.keep_index,
        bbox: args.bbox,
        relation: args.relation,
    };

    fs::create_dir_all(&args.output)?;
    let sink = LineFileSink::create(&args.output.join("elements.txt"))?;
    let classifier: Box<dyn StyleClassifier> = if args.only_matched {
        Box::new(KeyListClassifier::default())
    } else {
        Box::new(AcceptAll)
    };

    let mut session = Session::new(config);
    let stats = session.run(&sink, classifier.as_ref())?;

    println!("{stats}");
    Ok(())
}

fn main() {
    let args = Args::parse();
    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_module_path(false)
        .format_timestamp_nanos()
        .init();

    if let Err(e) = run(args) {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
}
