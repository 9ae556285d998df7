use std::path::{Path, PathBuf};

use htpages::{
    align_tables, default_combined_output, default_features_output, default_segment_output, enumerate_inputs,
    fetch_page_features, fill_missing, load_config, read_source_text, read_table, records_to_table, segment_pages,
    validate_config, write_table, AlignError, Alignment, CollisionPolicy, Config, EmitReport, EnumerateError,
    FetchError, FileError, PageTable, SegmentError, NO_BODY_DATA, USAGE_EXIT_CODE,
};

const USAGE: &str = "Usage:
  htpages segment <input.txt> [-o out.csv]
  htpages segment --glob <pattern> [--output-dir DIR]
  htpages fetch <htid> [--output-dir DIR]
  htpages combine <file1.csv> <file2.csv> [-o out.csv]
  htpages run <input.txt> <htid> [-o out.csv]
Options: --config <path>  --collision first_column|all_colliding";

fn fail(tool: &str, label: &str, code: i32, detail: String) -> ! {
    eprintln!(
        "{}",
        serde_json::json!({
            "tool": tool,
            "error": label,
            "detail": detail,
            "error_code": code
        })
    );
    std::process::exit(code);
}

fn fail_file(tool: &str, err: FileError) -> ! {
    fail(tool, err.label(), err.exit_code(), err.to_string())
}

fn fail_segment(err: SegmentError) -> ! {
    fail(
        "segment_pages",
        "NoSeparatorsFound",
        err.exit_code(),
        "no page separators found; expected lines like '## p. 1 (#1) ##############################'".into(),
    )
}

fn fail_align(err: AlignError) -> ! {
    fail("align_tables", "MissingKeyColumn", err.exit_code(), err.to_string())
}

fn fail_fetch(err: FetchError) -> ! {
    fail("fetch_page_features", "RemoteFetchFailure", err.exit_code(), err.to_string())
}

fn usage(detail: &str) -> ! {
    eprintln!("{}", USAGE);
    fail("cli", "Usage", USAGE_EXIT_CODE, detail.to_string())
}

fn log_emit(report: &EmitReport) {
    let mut event = serde_json::to_value(report).unwrap_or_default();
    if let Some(obj) = event.as_object_mut() {
        obj.insert("tool".to_string(), serde_json::json!("emit_table"));
    }
    eprintln!("{}", event);
}

fn log_alignment(alignment: &Alignment) {
    eprintln!(
        "{}",
        serde_json::json!({
            "tool":"align_tables",
            "rows": alignment.table.len(),
            "columns": alignment.table.columns,
            "renamed": alignment.renamed,
            "sentinels_cleared": alignment.sentinels_cleared,
            "sorted_numerically": alignment.sorted_numerically
        })
    );
    if !alignment.sorted_numerically {
        eprintln!(
            "{}",
            serde_json::json!({
                "tool":"align_tables",
                "warning":"non-numeric page keys; kept join order"
            })
        );
    }
    if !alignment.residual_collisions.is_empty() {
        eprintln!(
            "{}",
            serde_json::json!({
                "tool":"align_tables",
                "warning":"column names still shared after renaming; suffixed with _x/_y",
                "columns": alignment.residual_collisions
            })
        );
    }
    if !alignment.duplicate_keys.is_empty() {
        eprintln!(
            "{}",
            serde_json::json!({
                "tool":"align_tables",
                "warning":"duplicate page keys",
                "keys": alignment.duplicate_keys
            })
        );
    }
}

fn segment_file(input: &Path) -> PageTable {
    let text = read_source_text(input).unwrap_or_else(|e| fail_file("read_source_text", e));
    let records = segment_pages(&text).unwrap_or_else(|e| fail_segment(e));
    let labelled = records.iter().filter(|r| r.label.is_some()).count();
    eprintln!(
        "{}",
        serde_json::json!({
            "tool":"segment_pages",
            "file": input,
            "pages": records.len(),
            "labelled_pages": labelled
        })
    );
    records_to_table(&records)
}

fn fetch_features(htid: &str, cfg: &Config) -> PageTable {
    let api = cfg.feature_api();
    eprintln!(
        "{}",
        serde_json::json!({
            "tool":"fetch_page_features",
            "htid": htid,
            "url": htpages::features_url(htid, &api)
        })
    );
    let table = fetch_page_features(htid, &api).unwrap_or_else(|e| fail_fetch(e));
    eprintln!(
        "{}",
        serde_json::json!({
            "tool":"fetch_page_features",
            "htid": htid,
            "pages": table.len()
        })
    );
    table
}

fn combine(primary: &PageTable, secondary: &PageTable, cfg: &Config) -> PageTable {
    let alignment = align_tables(primary, secondary, &cfg.align_options()).unwrap_or_else(|e| fail_align(e));
    log_alignment(&alignment);
    alignment.table
}

/// Value following `flag`, if present.
fn flag_value(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    match args.get(pos + 1) {
        Some(v) if !v.starts_with("--") => Some(v.clone()),
        _ => usage(&format!("{} needs a value", flag)),
    }
}

/// Arguments that are neither flags nor flag values.
fn positionals(args: &[String]) -> Vec<String> {
    const VALUED: [&str; 6] = ["-o", "--output", "--output-dir", "--config", "--collision", "--glob"];
    let mut out = Vec::new();
    let mut skip = false;
    for a in args {
        if skip {
            skip = false;
            continue;
        }
        if VALUED.contains(&a.as_str()) {
            skip = true;
            continue;
        }
        if a.starts_with('-') {
            continue;
        }
        out.push(a.clone());
    }
    out
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().cloned() else {
        usage("missing command");
    };
    let rest = &args[1..];

    // 1) Config: explicit --config, else ./htpages.yaml when present, else defaults
    let config_path = flag_value(rest, "--config").map(PathBuf::from).or_else(|| {
        let p = PathBuf::from("htpages.yaml");
        p.exists().then_some(p)
    });
    let mut cfg = match &config_path {
        Some(p) => load_config(p).unwrap_or_else(|e| fail("load_config", "ConfigError", e.exit_code(), e.to_string())),
        None => Config::default(),
    };
    cfg = cfg.with_env_overrides(|k| std::env::var(k).ok());
    if let Some(policy) = flag_value(rest, "--collision") {
        cfg.combine.collision = match policy.as_str() {
            "first_column" => CollisionPolicy::FirstColumn,
            "all_colliding" => CollisionPolicy::AllColliding,
            other => usage(&format!("unknown collision policy '{}'", other)),
        };
    }
    if let Err(e) = validate_config(&cfg) {
        fail("load_config", "ConfigError", e.exit_code(), e.to_string());
    }
    eprintln!(
        "{}",
        serde_json::json!({
            "tool":"load_config",
            "file": config_path,
            "status":"ok",
            "ef_api_base": cfg.ef_api.base_url,
            "collision": cfg.combine.collision
        })
    );

    let output = flag_value(rest, "-o").or_else(|| flag_value(rest, "--output")).map(PathBuf::from);
    let output_dir = flag_value(rest, "--output-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.outputs.dir));
    let pos = positionals(rest);

    match command.as_str() {
        "segment" => {
            if let Some(pattern) = flag_value(rest, "--glob") {
                let files = enumerate_inputs(&pattern).unwrap_or_else(|e| {
                    let code = e.exit_code();
                    match e {
                        EnumerateError::NoFilesFound { pattern } => {
                            fail("enumerate_inputs", "NoFilesFound", code, format!("no files match {}", pattern))
                        }
                    }
                });
                eprintln!("{}", serde_json::json!({"tool":"enumerate_inputs", "count": files.len()}));
                for file in files {
                    let table = segment_file(&file);
                    let out = default_segment_output(&file, &output_dir);
                    let report = write_table(&table, &out).unwrap_or_else(|e| fail_file("emit_table", e));
                    log_emit(&report);
                }
            } else {
                let [input] = pos.as_slice() else {
                    usage("segment takes one input file");
                };
                let input = PathBuf::from(input);
                let table = segment_file(&input);
                let out = output.unwrap_or_else(|| default_segment_output(&input, &output_dir));
                let report = write_table(&table, &out).unwrap_or_else(|e| fail_file("emit_table", e));
                log_emit(&report);
            }
        }
        "fetch" => {
            let [htid] = pos.as_slice() else {
                usage("fetch takes one HTID");
            };
            let table = fetch_features(htid, &cfg);
            let out = output.unwrap_or_else(|| default_features_output(htid, &output_dir));
            let on_disk = fill_missing(&table, &cfg.combine.key, NO_BODY_DATA);
            let report = write_table(&on_disk, &out).unwrap_or_else(|e| fail_file("emit_table", e));
            log_emit(&report);
        }
        "combine" => {
            let [file1, file2] = pos.as_slice() else {
                usage("combine takes two CSV files");
            };
            let (file1, file2) = (PathBuf::from(file1), PathBuf::from(file2));
            let primary = read_table(&file1).unwrap_or_else(|e| fail_file("read_table", e));
            let secondary = read_table(&file2).unwrap_or_else(|e| fail_file("read_table", e));
            let merged = combine(&primary, &secondary, &cfg);
            let out = output.unwrap_or_else(|| default_combined_output(&file1, &file2, &output_dir));
            let report = write_table(&merged, &out).unwrap_or_else(|e| fail_file("emit_table", e));
            log_emit(&report);
        }
        "run" => {
            let [input, htid] = pos.as_slice() else {
                usage("run takes an input file and an HTID");
            };
            let input = PathBuf::from(input);
            let primary = segment_file(&input);
            let secondary = fetch_features(htid, &cfg);
            let merged = combine(&primary, &secondary, &cfg);
            let out = output.unwrap_or_else(|| {
                default_combined_output(&input, &default_features_output(htid, Path::new("")), &output_dir)
            });
            let report = write_table(&merged, &out).unwrap_or_else(|e| fail_file("emit_table", e));
            log_emit(&report);
        }
        other => usage(&format!("unknown command '{}'", other)),
    }
}
