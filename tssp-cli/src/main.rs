//! TSSP CLI - inspect and maintain TSSP shard directories

use anyhow::{bail, Context};
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tssp_core::tssp::{ReadContext, TsspFile, TsspFileName};
use tssp_core::{Config, FieldValue, MmsTables, TimeRange, Timestamp};

const USAGE: &str = "\
usage: tssp [--json] [--config <file>] <command>

commands:
  inspect <file>                      print the trailer and index summary of a file
  dump <file> --sid <id>              print the rows of one series
  list <shard-dir>                    list measurements and their files
  compact <shard-dir> --level <n>     run one round of level compaction
  compact <shard-dir> --full          fully compact every measurement
  compact <shard-dir> --merge-out-of-order
                                      merge out-of-order files into ordered ones";

struct Options {
    json: bool,
    config: Option<PathBuf>,
    args: Vec<String>,
}

fn parse_options() -> anyhow::Result<Options> {
    let mut opts = Options {
        json: false,
        config: None,
        args: Vec::new(),
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--json" => opts.json = true,
            "--config" => {
                let path = it.next().context("--config needs a file")?;
                opts.config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            _ => opts.args.push(arg),
        }
    }
    Ok(opts)
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Arc<Config>> {
    let conf = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<Config>(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => Config::default(),
    };
    conf.validate()?;
    Ok(Arc::new(conf))
}

fn format_time(ts: Timestamp) -> String {
    Utc.timestamp_nanos(ts).to_rfc3339()
}

fn field_json(v: FieldValue) -> serde_json::Value {
    match v {
        FieldValue::Float(f) => json!(f),
        FieldValue::Integer(i) => json!(i),
        FieldValue::Boolean(b) => json!(b),
        FieldValue::String(s) => json!(s),
    }
}

fn open_file(path: &str, conf: &Config) -> anyhow::Result<Arc<TsspFile>> {
    let path = Path::new(path);
    let order = TsspFileName::parse(path)
        .map(|_| !path.components().any(|c| c.as_os_str() == tssp_core::tssp::OUT_OF_ORDER_DIR))
        .with_context(|| format!("{} is not a tssp file", path.display()))?;
    TsspFile::open(path, order, conf).with_context(|| format!("opening {}", path.display()))
}

fn inspect(path: &str, conf: &Config, as_json: bool) -> anyhow::Result<()> {
    let file = open_file(path, conf)?;
    let tr = file.trailer()?;
    let metas = file.all_chunk_metas()?;
    let segments: usize = metas.iter().map(|cm| cm.segment_count()).sum();
    let items = file.reader().meta_index_items()?;

    if as_json {
        let out = json!({
            "file": file.path(),
            "measurement": tr.name,
            "size": file.file_size(),
            "series": tr.series_count,
            "rows": tr.rows,
            "min_id": tr.min_id,
            "max_id": tr.max_id,
            "min_time": tr.min_time,
            "max_time": tr.max_time,
            "meta_index_items": tr.meta_index_items,
            "segments": segments,
            "meta_index": items.iter().map(|m| json!({
                "id": m.id,
                "min_time": m.min_time,
                "max_time": m.max_time,
                "offset": m.offset,
                "size": m.size,
            })).collect::<Vec<_>>(),
            "chunk_metas": metas.iter().map(|cm| json!({
                "sid": cm.sid,
                "rows": cm.rows(),
                "segments": cm.segment_count(),
                "columns": cm.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("file:         {}", file.path().display());
        println!("measurement:  {}", tr.name);
        println!("size:         {} bytes", file.file_size());
        println!("series:       {} ({}..={})", tr.series_count, tr.min_id, tr.max_id);
        println!("rows:         {}", tr.rows);
        println!("time:         {} .. {}", format_time(tr.min_time), format_time(tr.max_time));
        println!("index items:  {}", tr.meta_index_items);
        println!("segments:     {}", segments);
        for (i, m) in items.iter().enumerate() {
            println!(
                "  index {:<4} first id {:<10} offset {:<10} size {:<8} {} .. {}",
                i,
                m.id,
                m.offset,
                m.size,
                format_time(m.min_time),
                format_time(m.max_time)
            );
        }
        for cm in &metas {
            println!(
                "  series {:<10} rows {:<8} segments {:<4} columns {}",
                cm.sid,
                cm.rows(),
                cm.segment_count(),
                cm.columns.len()
            );
        }
    }
    Ok(())
}

fn dump(path: &str, sid: u64, conf: &Config, as_json: bool) -> anyhow::Result<()> {
    let file = open_file(path, conf)?;
    let mut ctx = ReadContext::new(TimeRange::all());
    let Some(rec) = file.read_series(sid, None, &mut ctx)? else {
        bail!("series {} not found in {}", sid, path);
    };

    for row in 0..rec.row_nums() {
        let ts = rec.time(row);
        let values: Vec<(&str, FieldValue)> = rec
            .schema
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.is_time())
            .filter_map(|(i, f)| rec.value(i, row).map(|v| (f.name.as_str(), v)))
            .collect();
        if as_json {
            let fields: serde_json::Map<_, _> = values
                .into_iter()
                .map(|(k, v)| (k.to_string(), field_json(v)))
                .collect();
            println!("{}", json!({ "time": ts, "fields": fields }));
        } else {
            let cols: Vec<String> = values.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            println!("{} {}", format_time(ts), cols.join(","));
        }
    }
    Ok(())
}

fn list(dir: &str, conf: Arc<Config>, as_json: bool) -> anyhow::Result<()> {
    let (store, max_seq) = MmsTables::open(dir, conf).with_context(|| format!("opening shard {}", dir))?;
    let mut rows = Vec::new();
    for name in store.measurements() {
        for order in [true, false] {
            let Some(files) = store.table_files(&name, order) else {
                continue;
            };
            for f in files.iter() {
                let (min, max) = f.min_max_time()?;
                rows.push(json!({
                    "measurement": name,
                    "file": f.file_name().file_name(),
                    "order": order,
                    "level": f.level(),
                    "size": f.file_size(),
                    "min_time": min,
                    "max_time": max,
                }));
            }
        }
    }

    if as_json {
        println!("{}", json!({ "max_sequence": max_seq, "files": rows }));
    } else {
        println!("max sequence: {}", max_seq);
        for r in &rows {
            println!(
                "{:<24} {:<28} {:<5} L{} {:>12} bytes",
                r["measurement"].as_str().unwrap_or_default(),
                r["file"].as_str().unwrap_or_default(),
                if r["order"].as_bool().unwrap_or(true) { "order" } else { "ooo" },
                r["level"],
                r["size"],
            );
        }
    }
    store.close()?;
    Ok(())
}

fn compact(dir: &str, mode: &[String], conf: Arc<Config>) -> anyhow::Result<()> {
    let (store, _) = MmsTables::open(dir, conf).with_context(|| format!("opening shard {}", dir))?;
    match mode.first().map(String::as_str) {
        Some("--level") => {
            let level: u16 = mode
                .get(1)
                .context("--level needs a number")?
                .parse()
                .context("invalid level")?;
            let groups = store.level_compact(level)?;
            info!(level, groups, "level compaction finished");
        }
        Some("--full") => {
            for name in store.measurements() {
                let done = store.full_compact(&name)?;
                info!(measurement = %name, compacted = done, "full compaction finished");
            }
        }
        Some("--merge-out-of-order") => {
            for name in store.measurements() {
                let done = store.merge_out_of_order(&name)?;
                info!(measurement = %name, merged = done, "out-of-order merge finished");
            }
        }
        _ => bail!("{}", USAGE),
    }
    store.close()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = parse_options()?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr);
    if opts.json {
        builder.json().init();
    } else {
        builder.init();
    }

    let conf = load_config(opts.config.as_deref())?;
    let args: Vec<&str> = opts.args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["inspect", file] => inspect(file, &conf, opts.json),
        ["dump", file, "--sid", sid] => {
            let sid = sid.parse().context("invalid series id")?;
            dump(file, sid, &conf, opts.json)
        }
        ["list", dir] => list(dir, conf, opts.json),
        ["compact", dir, ..] => compact(dir, &opts.args[2..], conf),
        _ => bail!("{}", USAGE),
    }
}
