use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use promptslot_contracts::{
    EngineConfig, EventLog, GenerationResponse, JsonResultCache, MemoryResultCache, ResultCache,
    SavedTagRegistry,
};
use promptslot_engine::batch::HostSignal;
use promptslot_engine::documents::DocHandle;
use promptslot_engine::dom::Document;
use promptslot_engine::matcher::{directives, Delimiters, MatchDirective};
use promptslot_engine::mutator::ScanOutcome;
use promptslot_engine::position_index::{PositionIndex, SpanKind};
use promptslot_engine::transport::QueuedTransport;
use promptslot_engine::{PlaceholderEngine, ScanOptions};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "promptslot", version, about = "Placeholder scanner and generation dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Inspect(InspectArgs),
    Scan(ScanArgs),
}

#[derive(Debug, Parser)]
struct InspectArgs {
    /// Raw message text file; newlines become line breaks.
    #[arg(long)]
    message: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    tags: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ScanArgs {
    #[arg(long)]
    message: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    /// JSON result cache; results only live for this run when omitted.
    #[arg(long)]
    cache: Option<PathBuf>,
    /// Saved-tag registry, read before the scan and written back after it.
    #[arg(long)]
    tags: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Auto-fire cache misses and answer them with dry-run results.
    #[arg(long)]
    auto: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("promptslot error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Inspect(args) => run_inspect(args),
        Command::Scan(args) => run_scan(args),
    }
}

fn run_inspect(args: InspectArgs) -> Result<i32> {
    let text = read_message(&args.message)?;
    let config = load_config(args.config.as_deref())?;
    let registry = args
        .tags
        .as_deref()
        .map(SavedTagRegistry::load)
        .unwrap_or_default();

    let (doc, message) = Document::from_message_text(&text);
    let index = PositionIndex::build(&doc, message);
    let delimiters = Delimiters::new(&config.start_delimiter, &config.end_delimiter)
        .context("invalid delimiter configuration")?;
    let found = directives(
        index.text(),
        &delimiters,
        &registry,
        config.fingerprint_width,
        |_| false,
    );

    let spans: Vec<Value> = index
        .spans()
        .iter()
        .map(|span| {
            json!({
                "node": span.node.0,
                "kind": match span.kind {
                    SpanKind::Text => "text",
                    SpanKind::LineBreak => "line_break",
                },
                "start": span.start,
                "end": span.end,
            })
        })
        .collect();
    let directive_rows: Vec<Value> = found.iter().map(directive_json).collect();
    let report = json!({
        "logical_text": index.text(),
        "spans": spans,
        "directives": directive_rows,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

fn directive_json(directive: &MatchDirective) -> Value {
    match directive {
        MatchDirective::Pattern(found) => json!({
            "kind": "pattern",
            "content": found.inner_content,
            "full_match": found.full_match_text,
            "start": found.start_index,
            "end": found.end_index,
        }),
        MatchDirective::Saved(found) => json!({
            "kind": "saved",
            "content": found.content,
            "raw": found.raw,
            "insert_position": found.insert_position,
        }),
    }
}

fn run_scan(args: ScanArgs) -> Result<i32> {
    match args.cache.clone() {
        Some(path) => scan_with_cache(args, JsonResultCache::new(path)),
        None => scan_with_cache(args, MemoryResultCache::new()),
    }
}

fn scan_with_cache<C: ResultCache>(args: ScanArgs, cache: C) -> Result<i32> {
    let text = read_message(&args.message)?;
    let config = load_config(args.config.as_deref())?;
    let registry = args
        .tags
        .as_deref()
        .map(SavedTagRegistry::load)
        .unwrap_or_default();
    let events = match &args.events {
        Some(path) => EventLog::to_file(path),
        None => EventLog::discard(),
    };

    let (doc, message) = Document::from_message_text(&text);
    let mut engine = PlaceholderEngine::new(config, doc, cache, QueuedTransport::new())
        .with_events(events)
        .with_saved_tags(registry);
    if args.auto {
        engine.host_signal(HostSignal::GenerationFinished);
    }

    let report = engine.scan(
        DocHandle::PRIMARY,
        message,
        ScanOptions {
            auto_trigger: args.auto,
        },
    );
    if let ScanOutcome::Aborted(err) = &report.outcome {
        anyhow::bail!("scan aborted: {err}");
    }

    answer_dry_run(&mut engine);

    if let Some(path) = &args.tags {
        engine
            .saved_tags()
            .save(path)
            .with_context(|| format!("failed to write saved tags to {}", path.display()))?;
    }
    eprintln!(
        "placed={} present={} skipped={} cached={}",
        report.placed.len(),
        report.already_present,
        report.skipped,
        report.filled_from_cache
    );
    println!("{}", engine.documents().primary().to_markup(message));
    Ok(0)
}

/// Dry-run worker: answers each request as it appears and waits out the batch
/// interval between them. Returns how many requests were answered.
fn answer_dry_run<C: ResultCache>(engine: &mut PlaceholderEngine<C, QueuedTransport>) -> usize {
    let pause = Duration::from_millis(engine.config().batch_interval_ms);
    let mut answered = 0;
    loop {
        let requests = engine.transport_mut().drain();
        if requests.is_empty() {
            // An outstanding key with nothing left to answer would never settle.
            if engine.batch().queued() == 0 || engine.batch().outstanding().is_some() {
                break;
            }
            thread::sleep(pause);
            engine.tick();
            continue;
        }
        for request in requests {
            let url = format!("dryrun://{}.png", request.id);
            engine.handle_response(GenerationResponse::succeeded(request.id, url));
            answered += 1;
        }
    }
    answered
}

fn read_message(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("failed to read message from {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}
