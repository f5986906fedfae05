//! # shoal - interactive shell
//!
//! A REPL over the shoal storage engine. Reads commands from stdin,
//! executes them and prints results to stdout, so it works both
//! interactively and with commands piped in. Logs go to stderr.
//!
//! ## Commands
//!
//! ```text
//! SET key value                  Insert or update a key
//! GET key                        Look up a key (prints value or "(nil)")
//! DEL key                        Delete a key
//! SINGLEDEL key                  Delete the single SET of a key
//! MERGE key operand              Add a merge operand
//! DELRANGE start end             Delete every key in [start, end)
//! RKSET start end suffix value   Set a range key
//! RKUNSET start end suffix       Unset one suffix of a range key
//! RKDEL start end                Delete every range key in [start, end)
//! SCAN [start] [end]             Point keys in [start, end)
//! RANGES [start] [end]           Range keys in [start, end)
//! FLUSH                          Flush memtables to L0
//! COMPACT [start end]            Compact until settled, or compact a range
//! LSM                            Print the level structure
//! STATS                          Print engine metrics
//! EXIT / QUIT                    Flush and shut down
//! ```
//!
//! ## Configuration
//!
//! ```text
//! SHOAL_DIR                 Database directory         (default: "data")
//! SHOAL_LOG                 Log filter                 (default: "warn")
//! SHOAL_MEMTABLE_KB         Memtable size in KiB       (default: 4096)
//! SHOAL_WAL_SYNC            fsync every WAL append     (default: true)
//! SHOAL_L0_TRIGGER          L0 files that trigger a compaction (default: 4)
//! SHOAL_TARGET_FILE_KB      Target table size in KiB   (default: 2048)
//! SHOAL_AUTO_COMPACTIONS    Background compactions     (default: true)
//! SHOAL_COMPACTION_THREADS  Concurrent compactions     (default: 1)
//! SHOAL_MULTILEVEL          Multi-level compactions    (default: false)
//! SHOAL_VALUE_SEPARATION    Store large values in blob files (default: false)
//! SHOAL_BLOB_MIN_SIZE       Smallest separated value   (default: 1024)
//! SHOAL_BLOOM_BITS          Bloom filter bits per key, 0 disables (default: 10)
//! SHOAL_COMPARER            "bytewise" or "versioned"  (default: bytewise)
//! ```
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! shoal started (dir=data, seq=0, memtable=4096KiB, l0_trigger=4)
//! > SET name Alice
//! OK
//! > GET name
//! Alice
//! > SCAN
//! name -> Alice
//! (1 entries)
//! > EXIT
//! bye
//! ```

use anyhow::Result;
use config::Options;
use engine::{Engine, IterOptions, KeyTypes};
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn lossy(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}

/// The arguments after the command, or a usage error.
fn args<'a, const N: usize>(parts: &[&'a str], usage: &str) -> Result<[&'a str; N], String> {
    <[&str; N]>::try_from(parts).map_err(|_| format!("ERR usage: {}", usage))
}

fn print_scan(engine: &Engine, start: &str, end: &str) {
    match engine.scan(start.as_bytes(), end.as_bytes()) {
        Ok(results) if results.is_empty() => println!("(empty)"),
        Ok(results) => {
            for (k, v) in &results {
                println!("{} -> {}", lossy(k), lossy(v));
            }
            println!("({} entries)", results.len());
        }
        Err(e) => println!("ERR scan failed: {:#}", e),
    }
}

fn print_ranges(engine: &Engine, start: &str, end: &str) -> Result<()> {
    let mut it = engine.new_iter(IterOptions {
        lower_bound: (!start.is_empty()).then(|| start.as_bytes().to_vec()),
        upper_bound: (!end.is_empty()).then(|| end.as_bytes().to_vec()),
        key_types: KeyTypes::RangesOnly,
        ..IterOptions::default()
    })?;
    let mut count = 0;
    let mut valid = it.first()?;
    while valid {
        if let Some((s, e)) = it.range_bounds() {
            let keys: Vec<String> = it
                .range_keys()
                .iter()
                .map(|k| format!("{}={}", lossy(&k.suffix), lossy(&k.value)))
                .collect();
            println!("[{}, {}) {}", lossy(s), lossy(e), keys.join(" "));
            count += 1;
        }
        valid = it.next()?;
    }
    if count == 0 {
        println!("(empty)");
    } else {
        println!("({} spans)", count);
    }
    Ok(())
}

fn print_stats(engine: &Engine) {
    let m = engine.metrics();
    println!("visible_seq: {}", m.visible_seq);
    println!("version: {}, next file: {}", m.version, m.next_file_num);
    println!(
        "memtable: {} bytes, {} immutable",
        m.memtable_size, m.immutable_memtables
    );
    for (level, l) in m.levels.iter().enumerate() {
        if l.files > 0 || l.score > 0.0 {
            println!(
                "L{}: {} files, {} bytes, score {:.2}",
                level, l.files, l.size, l.score
            );
        }
    }
    println!("blob files: {}, {} bytes", m.blob_files, m.blob_size);
    println!("flushes: {}, {} bytes", m.flushes, m.flush_bytes);
    let counts: Vec<String> = m
        .compactions
        .count
        .iter()
        .map(|(kind, n)| format!("{}={}", kind, n))
        .collect();
    println!(
        "compactions: [{}] read {} bytes, wrote {} bytes, {} failed, {} cancelled",
        counts.join(" "),
        m.compactions.bytes_read,
        m.compactions.bytes_written,
        m.compactions.failed,
        m.compactions.cancelled
    );
    println!("snapshots: {}, open tables: {}", m.snapshots, m.open_tables);
}

/// Runs one command. Errors are rendered as `ERR ...` lines.
fn execute(engine: &Engine, cmd: &str, parts: &[&str]) -> Result<(), String> {
    let done = |r: Result<()>, what: &str| match r {
        Ok(()) => {
            println!("OK");
            Ok(())
        }
        Err(e) => Err(format!("ERR {} failed: {:#}", what, e)),
    };
    match cmd {
        "SET" | "MERGE" => {
            let Some((k, rest)) = parts.split_first() else {
                return Err(format!("ERR usage: {} key value", cmd));
            };
            let v = rest.join(" ");
            if v.is_empty() {
                return Err(format!("ERR usage: {} key value", cmd));
            }
            if cmd == "SET" {
                done(engine.set(k.as_bytes(), v.as_bytes()), "set")
            } else {
                done(engine.merge(k.as_bytes(), v.as_bytes()), "merge")
            }
        }
        "GET" => {
            let [k] = args::<1>(parts, "GET key")?;
            match engine.get(k.as_bytes()) {
                Ok(Some(v)) => println!("{}", lossy(&v)),
                Ok(None) => println!("(nil)"),
                Err(e) => return Err(format!("ERR read failed: {:#}", e)),
            }
            Ok(())
        }
        "DEL" => {
            let [k] = args::<1>(parts, "DEL key")?;
            done(engine.delete(k.as_bytes()), "del")
        }
        "SINGLEDEL" => {
            let [k] = args::<1>(parts, "SINGLEDEL key")?;
            done(engine.single_delete(k.as_bytes()), "singledel")
        }
        "DELRANGE" => {
            let [s, e] = args::<2>(parts, "DELRANGE start end")?;
            done(engine.delete_range(s.as_bytes(), e.as_bytes()), "delrange")
        }
        "RKSET" => {
            let [s, e, suffix, v] = args::<4>(parts, "RKSET start end suffix value")?;
            done(
                engine.range_key_set(s.as_bytes(), e.as_bytes(), suffix.as_bytes(), v.as_bytes()),
                "rkset",
            )
        }
        "RKUNSET" => {
            let [s, e, suffix] = args::<3>(parts, "RKUNSET start end suffix")?;
            done(
                engine.range_key_unset(s.as_bytes(), e.as_bytes(), suffix.as_bytes()),
                "rkunset",
            )
        }
        "RKDEL" => {
            let [s, e] = args::<2>(parts, "RKDEL start end")?;
            done(engine.range_key_delete(s.as_bytes(), e.as_bytes()), "rkdel")
        }
        "SCAN" => {
            let start = parts.first().copied().unwrap_or("");
            let end = parts.get(1).copied().unwrap_or("");
            print_scan(engine, start, end);
            Ok(())
        }
        "RANGES" => {
            let start = parts.first().copied().unwrap_or("");
            let end = parts.get(1).copied().unwrap_or("");
            print_ranges(engine, start, end).map_err(|e| format!("ERR ranges failed: {:#}", e))
        }
        "FLUSH" => done(engine.flush(), "flush"),
        "COMPACT" => {
            let r = match parts {
                [] => engine.compact(),
                [s, e] => engine.compact_range(s.as_bytes(), e.as_bytes()),
                _ => return Err("ERR usage: COMPACT [start end]".to_string()),
            };
            done(r, "compact")
        }
        "LSM" => {
            print!("{}", engine.lsm());
            Ok(())
        }
        "STATS" => {
            print_stats(engine);
            Ok(())
        }
        other => Err(format!("unknown command: {}", other)),
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("SHOAL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let dir = env_or("SHOAL_DIR", "data");
    let opts = Options::from_env()?;
    let (memtable_kb, l0_trigger) = (opts.memtable_size / 1024, opts.l0_compaction_threshold);
    let mut engine = Engine::open(&dir, opts)?;

    println!(
        "shoal started (dir={}, seq={}, memtable={}KiB, l0_trigger={})",
        dir,
        engine.visible_seq(),
        memtable_kb,
        l0_trigger
    );
    println!("Commands: SET | GET | DEL | SINGLEDEL | MERGE | DELRANGE | RKSET | RKUNSET | RKDEL");
    println!("          SCAN | RANGES | FLUSH | COMPACT | LSM | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        if let Some(cmd) = parts.next() {
            let cmd = cmd.to_uppercase();
            if cmd == "EXIT" || cmd == "QUIT" {
                break;
            }
            let rest: Vec<&str> = parts.collect();
            if let Err(msg) = execute(&engine, &cmd, &rest) {
                println!("{}", msg);
            }
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    engine.close()?;
    println!("bye");
    Ok(())
}
