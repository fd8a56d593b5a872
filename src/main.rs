//! LETHE - Blob-Separated Key-Value Storage Engine
//! Interactive shell. Usage: `lethe [config.toml]`

use std::io::{self, BufRead, Write};

use lethe::{Config, GcOutcome, Lethe, RunMode};

fn load_config() -> lethe::Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::from_toml_file(path),
        None => Ok(Config::default()),
    }
}

fn parse_mode(name: &str) -> Option<RunMode> {
    match name.to_lowercase().as_str() {
        "normal" => Some(RunMode::Normal),
        "readonly" | "read-only" => Some(RunMode::ReadOnly),
        "fallback" => Some(RunMode::Fallback),
        _ => None,
    }
}

fn main() {
    env_logger::init();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║           LETHE Storage Engine            ║");
    println!("  ║    Blob-Separated Key-Value Store v0.1    ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    set <key> <value>  - Store a key-value pair");
    println!("    get <key>          - Retrieve a value by key");
    println!("    del <key>          - Delete a key");
    println!("    scan               - List all key-value pairs");
    println!("    flush              - Flush to L0 and seal the active blob file");
    println!("    compact [level]    - Compact everything into a level");
    println!("    gc                 - Run one garbage collection cycle");
    println!("    purge              - Delete unreferenced obsolete blob files");
    println!("    mode [name]        - Show or set run mode (normal/readonly/fallback)");
    println!("    files              - List blob files");
    println!("    stats              - Show engine metrics");
    println!("    exit               - Shutdown engine");
    println!();

    let engine = match load_config().and_then(Lethe::open) {
        Ok(e) => e,
        Err(err) => {
            eprintln!("[ERROR] Failed to open engine: {}", err);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("lethe> ");
        if stdout.flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break, // EOF
            Ok(_) => {}
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0].to_lowercase().as_str() {
            "set" | "put" => {
                if parts.len() < 3 {
                    println!("  Usage: set <key> <value>");
                    continue;
                }
                let key = parts[1].as_bytes().to_vec();
                let value = parts[2..].join(" ").into_bytes();
                match engine.put(key, value) {
                    Ok(()) => println!("  OK"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "get" => {
                if parts.len() < 2 {
                    println!("  Usage: get <key>");
                    continue;
                }
                match engine.get(parts[1].as_bytes()) {
                    Ok(Some(value)) => match String::from_utf8(value) {
                        Ok(s) => println!("  \"{}\"", s),
                        Err(_) => println!("  <binary data>"),
                    },
                    Ok(None) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "del" | "delete" => {
                if parts.len() < 2 {
                    println!("  Usage: del <key>");
                    continue;
                }
                match engine.delete(parts[1].as_bytes().to_vec()) {
                    Ok(()) => println!("  OK (deleted)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "scan" | "list" => match engine.scan() {
                Ok(entries) if entries.is_empty() => println!("  (empty)"),
                Ok(entries) => {
                    for (key, value) in &entries {
                        let k = String::from_utf8_lossy(key);
                        let v = String::from_utf8_lossy(value);
                        println!("  {} -> {}", k, v);
                    }
                    println!("  ({} entries)", entries.len());
                }
                Err(e) => println!("  ERROR: {}", e),
            },
            "flush" => match engine.flush() {
                Ok(()) => println!("  OK"),
                Err(e) => println!("  ERROR: {}", e),
            },
            "compact" => {
                let default_level = engine.config().last_level();
                let level = match parts.get(1).map(|s| s.parse::<usize>()) {
                    None => default_level,
                    Some(Ok(level)) => level,
                    Some(Err(_)) => {
                        println!("  Usage: compact [level]");
                        continue;
                    }
                };
                match engine.compact_range(None, None, level) {
                    Ok(()) => println!("  OK (compacted into L{})", level),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "gc" => match engine.run_gc() {
                Ok(GcOutcome::NoCandidates) => println!("  nothing to collect"),
                Ok(GcOutcome::Deferred { estimated }) => {
                    println!("  deferred ({} discardable bytes below the batch floor)", estimated)
                }
                Ok(GcOutcome::Completed(stats)) => println!(
                    "  collected {} files: {} records rewritten, {} bytes read, {} bytes written",
                    stats.files, stats.records_rewritten, stats.bytes_read, stats.bytes_written
                ),
                Err(e) => println!("  ERROR: {}", e),
            },
            "purge" => match engine.purge_obsolete_files() {
                Ok(stats) => println!(
                    "  {} deleted, {} failed, {} still referenced",
                    stats.deleted, stats.failed, stats.waiting
                ),
                Err(e) => println!("  ERROR: {}", e),
            },
            "mode" => match parts.get(1) {
                None => println!("  {:?}", engine.run_mode()),
                Some(name) => match parse_mode(name) {
                    Some(mode) => {
                        let previous = engine.set_run_mode(mode);
                        println!("  {:?} -> {:?}", previous, mode);
                    }
                    None => println!("  Usage: mode [normal|readonly|fallback]"),
                },
            },
            "files" => {
                let stats = engine.blob_file_stats();
                if stats.is_empty() {
                    println!("  (no blob files)");
                }
                for f in &stats {
                    println!(
                        "  #{:06} L{} {:>10} bytes live {:>10}/{:<10} discardable {:.2} {:?}{}",
                        f.file_number,
                        f.level,
                        f.file_size,
                        f.live_bytes,
                        f.data_bytes,
                        f.discardable_ratio,
                        f.state,
                        if f.marked_for_merge { " (merge)" } else { "" }
                    );
                }
            }
            "info" | "stats" | "metrics" => {
                println!("  Entries:    {}", engine.len());
                println!("  Index size: {} bytes", engine.index_size());
                println!("  Blob files: {}", engine.live_blob_file_count());
                println!("  Run mode:   {:?}", engine.run_mode());
                println!("{}", engine.metrics().report());
            }
            "exit" | "quit" | "q" => {
                println!("  Shutting down LETHE...");
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'exit' to quit.", parts[0]);
            }
        }
    }

    if let Err(e) = engine.close() {
        eprintln!("[ERROR] {}", e);
    }
}
