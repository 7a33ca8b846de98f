//! Memo CLI
//!
//! A semantic memory for command-line agents: notes in, similar notes out.
//!
//! ```bash
//! # Store a note (with optional metadata)
//! memo save -m 'source: user, tags: [medical, allergy]' allergic to penicillin
//!
//! # Overwrite record 1 in place
//! memo save 1 allergic to penicillin and aspirin
//!
//! # Recall with a metadata pre-filter
//! memo recall -k 5 --filter 'tags: {$contains: allergy}' what medication to avoid
//!
//! # Inspect metadata without touching the model
//! memo analyze --filter 'source: user' --stats priority
//!
//! # Drop the database
//! memo clean
//! ```
//!
//! Results go to stdout; diagnostics and `-v` logs go to stderr.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use memo_db::arena::Arena;
use memo_db::engine::{DbPaths, MemoryEngine};
use memo_db::filter::filter_mask;
use memo_db::meta::{parse_record, MetaRecord, MetaStore, MetaValue};

const MAX_K: usize = 100;

#[derive(Parser)]
#[command(name = "memo")]
#[command(about = "A GPU-accelerated semantic memory for the command line")]
#[command(version)]
struct Cli {
    /// Database basename; sidecars are <base>.memo / .txt / .meta
    #[arg(short = 'f', long = "file", global = true, default_value = "memo")]
    file: String,

    /// Verbose logs on stderr
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Directory holding model.bin and tokenizer.bin
    #[arg(long = "model-dir", global = true, default_value = "models")]
    model_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed and store a note; a leading integer overwrites that record
    Save {
        /// Inline flow metadata, e.g. 'source: user, priority: 3'
        #[arg(short = 'm', long = "meta")]
        metadata: Option<String>,

        /// Note text ([<id>] <note words...>)
        #[arg(required = true)]
        note: Vec<String>,
    },

    /// Embed a query and print the most similar notes
    Recall {
        /// Number of results (capped at 100)
        #[arg(short = 'k', default_value_t = 2)]
        k: usize,

        /// Metadata pre-filter, e.g. 'priority: {$gte: 2}'
        #[arg(long = "filter")]
        filter: Option<String>,

        /// Query text
        #[arg(required = true)]
        query: Vec<String>,
    },

    /// Remove the database sidecars
    Clean,

    /// Inspect metadata matching a filter (no model, no GPU)
    Analyze {
        /// Metadata filter expression
        #[arg(long = "filter")]
        filter: String,

        /// Comma-separated columns, e.g. id,source,tags
        #[arg(long = "fields", value_delimiter = ',')]
        fields: Option<Vec<String>>,

        /// Print cardinality and numeric range for one key
        #[arg(long = "stats")]
        stats: Option<String>,

        /// Max rows to print
        #[arg(long = "limit", default_value_t = 100)]
        limit: usize,

        /// Rows to skip before printing
        #[arg(long = "offset", default_value_t = 0)]
        offset: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Save { metadata, note } => cmd_save(&cli.file, &cli.model_dir, metadata, note),
        Commands::Recall { k, filter, query } => {
            cmd_recall(&cli.file, &cli.model_dir, k, filter, query)
        }
        Commands::Clean => cmd_clean(&cli.file),
        Commands::Analyze {
            filter,
            fields,
            stats,
            limit,
            offset,
        } => cmd_analyze(&cli.file, &filter, fields, stats, limit, offset),
    }
}

fn cmd_save(
    db_base: &str,
    model_dir: &std::path::Path,
    metadata: Option<String>,
    note_args: Vec<String>,
) -> anyhow::Result<()> {
    // A leading integer followed by note text selects overwrite-in-place.
    let (override_id, note_words) = match note_args.split_first() {
        Some((first, rest)) if !rest.is_empty() && is_integer(first) => {
            (Some(first.parse::<u64>().context("invalid record id")?), rest)
        }
        _ => (None, &note_args[..]),
    };

    let note = note_words.join(" ");
    if note.trim().is_empty() {
        anyhow::bail!("save requires non-empty note text");
    }

    let mut engine = MemoryEngine::open(model_dir, db_base)?;

    let id = match override_id {
        Some(id) => {
            engine.overwrite_note(id, &note, metadata.as_deref())?;
            id
        }
        None => engine.save_note(&note, metadata.as_deref())?,
    };

    println!("Memorized: '{note}' (ID: {id})");
    Ok(())
}

fn cmd_recall(
    db_base: &str,
    model_dir: &std::path::Path,
    k: usize,
    filter: Option<String>,
    query_args: Vec<String>,
) -> anyhow::Result<()> {
    let query = query_args.join(" ");
    if query.trim().is_empty() {
        anyhow::bail!("recall requires a non-empty query");
    }
    let k = k.clamp(1, MAX_K);

    let mut engine = MemoryEngine::open(model_dir, db_base)?;

    println!("Top {k} results for '{query}':");
    let hits = engine.recall(&query, k, filter.as_deref())?;
    for (rank, hit) in hits.iter().enumerate() {
        println!("  [{}] Score: {:.4} | {}", rank + 1, hit.score, hit.body);
    }
    Ok(())
}

fn cmd_clean(db_base: &str) -> anyhow::Result<()> {
    let paths = DbPaths::for_base(db_base);
    let removed = paths
        .clean()
        .with_context(|| format!("failed to remove database '{db_base}'"))?;
    let listing = format!(
        "({}, {}, {})",
        paths.index.display(),
        paths.text.display(),
        paths.meta.display()
    );
    if removed {
        println!("Cleared memory database {listing}");
    } else {
        println!("Database already empty {listing}");
    }
    Ok(())
}

fn cmd_analyze(
    db_base: &str,
    filter: &str,
    fields: Option<Vec<String>>,
    stats: Option<String>,
    limit: usize,
    offset: usize,
) -> anyhow::Result<()> {
    if filter.trim().is_empty() {
        anyhow::bail!("analyze requires --filter <expr>");
    }
    if limit < 1 {
        anyhow::bail!("--limit must be >= 1");
    }

    let paths = DbPaths::for_base(db_base);
    let metas = match MetaStore::load(&paths.meta, 0) {
        Ok(store) => store,
        Err(e) => {
            tracing::debug!(error = %e, "no metadata sidecar");
            MetaStore::new(0)
        }
    };

    let mut arena = Arena::with_capacity(1 << 26);
    let mask = filter_mask(&metas, &mut arena, filter)
        .map_err(|e| anyhow::anyhow!("invalid --filter expression: {e}"))?;

    // Matching records, parsed once for field resolution and display.
    let mut matches: Vec<(u64, MetaRecord)> = Vec::new();
    for (id, keep) in mask.iter().enumerate() {
        if !keep {
            continue;
        }
        if let Some(line) = metas.get(id as u64) {
            let record = parse_record(&mut arena, line)
                .map_err(|e| anyhow::anyhow!("metadata parse failed: {e}"))?;
            matches.push((id as u64, record));
        }
    }

    println!("Matched: {}", matches.len());

    if let Some(key) = stats {
        print_stats(&arena, &matches, &key, &metas);
        return Ok(());
    }

    let selected = fields.unwrap_or_else(|| default_fields(&arena, &matches));
    let headers: Vec<String> = selected
        .iter()
        .map(|f| if f == "id" { "ID".to_string() } else { f.clone() })
        .collect();

    let rows: Vec<Vec<String>> = matches
        .iter()
        .skip(offset)
        .take(limit)
        .map(|(id, record)| {
            selected
                .iter()
                .map(|field| resolve_field(&arena, *id, record, field, &metas))
                .collect()
        })
        .collect();

    print_table(&headers, &rows);
    Ok(())
}

/// Column value for one record: `id`, the whole raw `metadata`, or a
/// metadata key (with or without a `metadata.` prefix).
fn resolve_field(
    arena: &Arena,
    id: u64,
    record: &MetaRecord,
    field: &str,
    metas: &MetaStore,
) -> String {
    if field == "id" {
        return id.to_string();
    }
    if field == "metadata" {
        return metas.get(id).unwrap_or("").to_string();
    }
    let key = field.strip_prefix("metadata.").unwrap_or(field);
    record
        .find(arena, key)
        .map(|v| format_value(arena, v))
        .unwrap_or_default()
}

fn format_value(arena: &Arena, value: &MetaValue) -> String {
    match value {
        MetaValue::Str(r) => arena.str_of(*r).to_string(),
        MetaValue::Int(i) => i.to_string(),
        MetaValue::Array(items) => {
            let parts: Vec<&str> = items.iter().map(|r| arena.str_of(*r)).collect();
            format!("[{}]", parts.join(", "))
        }
        MetaValue::Submap(raw) => arena.str_of(*raw).to_string(),
    }
}

/// `id` plus the first three metadata keys seen across the matches.
fn default_fields(arena: &Arena, matches: &[(u64, MetaRecord)]) -> Vec<String> {
    let mut keys: Vec<String> = matches
        .iter()
        .flat_map(|(_, record)| record.fields.iter())
        .map(|f| arena.str_of(f.key).to_string())
        .collect();
    keys.sort();
    keys.dedup();
    keys.truncate(3);

    let mut fields = vec!["id".to_string()];
    fields.extend(keys);
    fields
}

fn print_stats(arena: &Arena, matches: &[(u64, MetaRecord)], key: &str, metas: &MetaStore) {
    let values: Vec<String> = matches
        .iter()
        .map(|(id, record)| resolve_field(arena, *id, record, key, metas))
        .filter(|v| !v.is_empty())
        .collect();

    // Counts kept in first-seen order; the stable sort then means tied
    // counts list in encounter order.
    let mut by_count: Vec<(&str, usize)> = Vec::new();
    for v in &values {
        match by_count.iter_mut().find(|(name, _)| *name == v.as_str()) {
            Some((_, count)) => *count += 1,
            None => by_count.push((v.as_str(), 1)),
        }
    }
    by_count.sort_by(|a, b| b.1.cmp(&a.1));

    println!("Key: {key}");
    println!("Cardinality (distinct values): {}", by_count.len());
    println!("Cardinality by value:");
    for (name, count) in by_count.iter().take(4) {
        println!("  {name}: {count}");
    }
    if by_count.len() > 4 {
        let shown: usize = by_count.iter().take(4).map(|(_, c)| c).sum();
        let total: usize = by_count.iter().map(|(_, c)| c).sum();
        println!(
            "  other (aggregate of {} additional values): {}",
            by_count.len() - 4,
            total - shown
        );
    }

    let numeric: Option<Vec<f64>> = values.iter().map(|v| v.parse::<f64>().ok()).collect();
    if let Some(numeric) = numeric.filter(|n| !n.is_empty()) {
        let min = numeric.iter().copied().fold(f64::INFINITY, f64::min);
        let max = numeric.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = numeric.iter().sum::<f64>() / numeric.len() as f64;
        println!("Range (numeric):");
        println!("  min: {min}");
        println!("  max: {max}");
        println!("  avg: {avg:.2}");
        return;
    }

    // Not numeric; try a date-like range instead.
    let dates: Option<Vec<&str>> = values.iter().map(|v| parse_iso_date(v)).collect();
    if let Some(dates) = dates.filter(|d| !d.is_empty()) {
        let start = dates.iter().min().unwrap();
        let end = dates.iter().max().unwrap();
        println!("Range (date-like):");
        println!("  start: {start}");
        println!("  end:   {end}");
    }
}

/// The date portion of an ISO-8601 value, or `None` if the value is not
/// date-like. An optional `T...` time suffix and a trailing `Z` are
/// tolerated; the calendar part must be zero-padded `YYYY-MM-DD`.
fn parse_iso_date(value: &str) -> Option<&str> {
    let s = value.trim();
    let s = s.strip_suffix('Z').unwrap_or(s);
    let b = s.as_bytes();
    if b.len() < 10 || b[4] != b'-' || b[7] != b'-' {
        return None;
    }
    if !b[..4]
        .iter()
        .chain(&b[5..7])
        .chain(&b[8..10])
        .all(u8::is_ascii_digit)
    {
        return None;
    }
    if b.len() > 10 && b[10] != b'T' {
        return None;
    }
    let month: u32 = s[5..7].parse().ok()?;
    let day: u32 = s[8..10].parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(&s[..10])
}

fn print_table(headers: &[String], rows: &[Vec<String>]) {
    if headers.is_empty() {
        return;
    }
    let mut widths: Vec<usize> = headers.iter().map(String::len).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let render = |cells: &[String]| {
        cells
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{:<width$}", c, width = widths[i]))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    println!("{}", render(headers));
    for row in rows {
        println!("{}", render(row));
    }
}

fn is_integer(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_dates_are_recognized_and_truncated_to_the_day() {
        assert_eq!(parse_iso_date("2026-01-15"), Some("2026-01-15"));
        assert_eq!(parse_iso_date(" 2026-01-15 "), Some("2026-01-15"));
        assert_eq!(parse_iso_date("2026-01-15T10:30:00"), Some("2026-01-15"));
        assert_eq!(parse_iso_date("2026-01-15T10:30:00Z"), Some("2026-01-15"));
    }

    #[test]
    fn non_dates_are_rejected() {
        assert_eq!(parse_iso_date(""), None);
        assert_eq!(parse_iso_date("user"), None);
        assert_eq!(parse_iso_date("2026-1-15"), None);
        assert_eq!(parse_iso_date("2026-13-01"), None);
        assert_eq!(parse_iso_date("2026-01-32"), None);
        assert_eq!(parse_iso_date("2026-01-15x"), None);
        assert_eq!(parse_iso_date("20260115"), None);
    }

    #[test]
    fn date_min_max_is_chronological() {
        let dates = ["2026-02-15", "2026-01-15", "2026-12-01"];
        let parsed: Vec<&str> = dates.iter().map(|d| parse_iso_date(d).unwrap()).collect();
        assert_eq!(parsed.iter().min(), Some(&"2026-01-15"));
        assert_eq!(parsed.iter().max(), Some(&"2026-12-01"));
    }
}
