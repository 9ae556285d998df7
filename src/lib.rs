use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use globwalk::GlobWalkerBuilder;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Join key shared by every page-indexed table.
pub const PAGE_KEY: &str = "page";
/// Sentinel written by the extracted-features export when a page has no body section.
pub const NO_BODY_DATA: &str = "No body data";
/// Older exports used this wording for the same thing.
pub const NO_PAGE_DATA: &str = "No page data";
/// Metric column produced by the extracted-features fetch.
pub const WORDS_POS_COLUMN: &str = "words_pos";
pub const DEFAULT_EF_API_BASE: &str = "https://data.htrc.illinois.edu/ef-api/volumes/";
pub const EF_API_BASE_ENV: &str = "HTPAGES_EF_API_BASE";

// `## p. xiv (#20) ##############################`
static SEPARATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"## p\.? ([^(#\n]*)\(#([^)\n]+)\) #{30,}").unwrap());
// two or more consecutive newlines
static PARAGRAPH_BREAK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:\r?\n){2,}").unwrap());
static SPACE_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").unwrap());

#[derive(Debug, Error)]
pub enum FileError {
    #[error("InputNotFound: {0}")]
    InputNotFound(String),
    #[error("InputUnreadable: {0}")]
    Unreadable(String),
    #[error("MalformedTable: {0}")]
    MalformedTable(String),
    #[error("WriteFailure: {0}")]
    WriteFailure(String),
}

impl FileError {
    pub fn label(&self) -> &'static str {
        match self {
            FileError::InputNotFound(_) => "InputNotFound",
            FileError::Unreadable(_) => "InputUnreadable",
            FileError::MalformedTable(_) => "MalformedTable",
            FileError::WriteFailure(_) => "WriteFailure",
        }
    }

    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            FileError::WriteFailure(_) => 6,
            _ => 1,
        }
    }
}

/// Read a full-text export into memory.
pub fn read_source_text(path: &Path) -> Result<String, FileError> {
    if !path.exists() {
        return Err(FileError::InputNotFound(path.display().to_string()));
    }
    std::fs::read_to_string(path).map_err(|e| FileError::Unreadable(format!("{}: {}", path.display(), e)))
}

#[derive(Debug, Error)]
pub enum EnumerateError {
    #[error("NoFilesFound")]
    NoFilesFound { pattern: String },
}

impl EnumerateError {
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Enumerate full-text exports using a glob pattern (e.g., "./input/**/*.txt").
/// Returns a sorted list of paths.
pub fn enumerate_inputs(glob_pattern: &str) -> Result<Vec<PathBuf>, EnumerateError> {
    let root = if Path::new(glob_pattern).is_absolute() { "/" } else { "." };
    let mut pat = glob_pattern.to_string();
    if pat.starts_with("./") { pat = pat.trim_start_matches("./").to_string(); }
    let mut paths: Vec<PathBuf> = GlobWalkerBuilder::from_patterns(root, &[pat.as_str()])
        .case_insensitive(false)
        .follow_links(false)
        .build()
        .map_err(|_| EnumerateError::NoFilesFound { pattern: glob_pattern.to_string() })?
        .filter_map(|e| e.ok())
        .map(|e| e.path().to_path_buf())
        .collect();

    paths.sort();
    paths.retain(|p| p.is_file());

    if paths.is_empty() {
        return Err(EnumerateError::NoFilesFound { pattern: glob_pattern.to_string() });
    }
    Ok(paths)
}

fn file_stem(path: &Path) -> String {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("output").to_string()
}

/// `<input stem>.csv` in `dir`.
pub fn default_segment_output(input: &Path, dir: &Path) -> PathBuf {
    dir.join(format!("{}.csv", file_stem(input)))
}

/// HTIDs carry slashes (`uc2.ark:/13960/...`), which cannot appear in a file name.
pub fn default_features_output(htid: &str, dir: &Path) -> PathBuf {
    dir.join(format!("{}.csv", htid.replace('/', "_")))
}

pub fn default_combined_output(file1: &Path, file2: &Path, dir: &Path) -> PathBuf {
    dir.join(format!("{}_{}_combined.csv", file_stem(file1), file_stem(file2)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRecord {
    /// Sequence number from `(#<seq>)`, kept as text.
    pub page: String,
    /// Printed page label (`xiv` in `## p. xiv (#20)`), if the export had one.
    pub label: Option<String>,
    pub text: String,
    pub clean_text: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SegmentError {
    #[error("NoSeparatorsFound")]
    NoSeparatorsFound,
}

impl SegmentError {
    pub fn exit_code(&self) -> i32 {
        4
    }
}

struct Separator {
    start: usize,
    end: usize,
    seq: String,
    label: Option<String>,
}

/// Split a full-text export into pages on its `## p. ... (#n) ###...` separator lines.
/// Every separator yields exactly one record, in document order; text before the
/// first separator is dropped.
pub fn segment_pages(text: &str) -> Result<Vec<PageRecord>, SegmentError> {
    let separators: Vec<Separator> = SEPARATOR_RE
        .captures_iter(text)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let seq = cap.get(2)?.as_str().to_string();
            let label = cap
                .get(1)
                .map(|m| m.as_str().trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            Some(Separator { start: whole.start(), end: whole.end(), seq, label })
        })
        .collect();

    if separators.is_empty() {
        return Err(SegmentError::NoSeparatorsFound);
    }

    let mut pages = Vec::with_capacity(separators.len());
    for (i, sep) in separators.iter().enumerate() {
        let end = separators.get(i + 1).map(|next| next.start).unwrap_or(text.len());
        let raw = text[sep.end..end].trim();
        pages.push(PageRecord {
            page: sep.seq.clone(),
            label: sep.label.clone(),
            text: raw.to_string(),
            clean_text: clean_page_text(raw),
        });
    }
    Ok(pages)
}

/// Undo OCR line wrapping: single newlines become spaces, paragraph breaks are kept
/// as one blank line, space runs collapse to one.
/// A whitespace-only segment between two breaks is dropped so the breaks merge.
pub fn clean_page_text(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let paragraphs: Vec<String> = PARAGRAPH_BREAK_RE
        .split(raw)
        .filter(|p| !p.trim().is_empty())
        .map(|p| p.replace("\r\n", " ").replace('\n', " "))
        .collect();
    let joined = paragraphs.join("\n\n");
    SPACE_RUN_RE.replace_all(&joined, " ").trim().to_string()
}

/// In-memory delimited table. Cells are `None` when the source had no value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl PageTable {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self { columns: columns.into_iter().map(Into::into).collect(), rows: Vec::new() }
    }

    /// Append a row, padding or truncating it to the column count.
    pub fn push_row(&mut self, mut row: Vec<Option<String>>) {
        row.resize(self.columns.len(), None);
        self.rows.push(row);
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    pub fn column_values(&self, column: &str) -> Vec<Option<&str>> {
        match self.column_index(column) {
            Some(idx) => self.rows.iter().map(|r| r.get(idx).and_then(|c| c.as_deref())).collect(),
            None => Vec::new(),
        }
    }
}

/// Columns `page, text, clean_text`, one row per record.
pub fn records_to_table(records: &[PageRecord]) -> PageTable {
    let mut table = PageTable::new([PAGE_KEY, "text", "clean_text"]);
    for r in records {
        table.push_row(vec![
            Some(r.page.clone()),
            Some(r.text.clone()),
            Some(r.clean_text.clone()),
        ]);
    }
    table
}

/// Parse CSV text with a header row. Empty cells become `None`; repeated header
/// names get a `.1`, `.2`, ... suffix so every column stays addressable.
pub fn parse_table(data: &[u8]) -> Result<PageTable, FileError> {
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(data);
    let headers = rdr.headers().map_err(|e| FileError::MalformedTable(e.to_string()))?.clone();

    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut columns = Vec::with_capacity(headers.len());
    for h in headers.iter() {
        let n = seen.entry(h.to_string()).or_insert(0);
        columns.push(if *n == 0 { h.to_string() } else { format!("{}.{}", h, n) });
        *n += 1;
    }

    let mut table = PageTable::new(columns);
    for record in rdr.records() {
        let record = record.map_err(|e| FileError::MalformedTable(e.to_string()))?;
        table.push_row(
            record
                .iter()
                .map(|v| if v.is_empty() { None } else { Some(v.to_string()) })
                .collect(),
        );
    }
    Ok(table)
}

pub fn read_table(path: &Path) -> Result<PageTable, FileError> {
    if !path.exists() {
        return Err(FileError::InputNotFound(path.display().to_string()));
    }
    let bytes = std::fs::read(path).map_err(|e| FileError::Unreadable(format!("{}: {}", path.display(), e)))?;
    parse_table(&bytes).map_err(|e| match e {
        FileError::MalformedTable(msg) => FileError::MalformedTable(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

pub fn table_to_csv(table: &PageTable) -> Result<Vec<u8>, FileError> {
    let write_failure = |e: csv::Error| FileError::WriteFailure(e.to_string());
    let mut wtr = csv::WriterBuilder::new().from_writer(Vec::new());
    wtr.write_record(&table.columns).map_err(write_failure)?;
    for row in &table.rows {
        wtr.write_record(row.iter().map(|c| c.as_deref().unwrap_or(""))).map_err(write_failure)?;
    }
    wtr.into_inner().map_err(|e| FileError::WriteFailure(e.to_string()))
}

#[derive(Debug, Clone, Serialize)]
pub struct EmitReport {
    pub path: String,
    pub rows: usize,
    pub sha256: String,
}

/// Atomically write `table` as CSV: a temp file in the destination directory is
/// persisted over `path` only once fully written.
pub fn write_table(table: &PageTable, path: &Path) -> Result<EmitReport, FileError> {
    let bytes = table_to_csv(table)?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let write_failure = |e: std::io::Error| FileError::WriteFailure(format!("{}: {}", path.display(), e));
    std::fs::create_dir_all(&dir).map_err(write_failure)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_failure)?;
    tmp.write_all(&bytes).map_err(write_failure)?;
    tmp.flush().map_err(write_failure)?;
    tmp.persist(path).map_err(|e| write_failure(e.error))?;

    Ok(EmitReport { path: path.to_string_lossy().to_string(), rows: table.len(), sha256: sha256_hex(&bytes) })
}

// Utility to compute sha256 hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    out.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureApiConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for FeatureApiConfig {
    fn default() -> Self {
        Self { base_url: DEFAULT_EF_API_BASE.to_string(), timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("RemoteFetchFailure: {url}: {reason}")]
    RemoteFetchFailure { url: String, reason: String },
}

impl FetchError {
    pub fn exit_code(&self) -> i32 {
        7
    }
}

#[derive(Debug, Deserialize)]
struct EfResponse {
    #[serde(default)]
    data: Option<EfData>,
}

#[derive(Debug, Deserialize)]
struct EfData {
    #[serde(default)]
    pages: Vec<EfPage>,
}

#[derive(Debug, Deserialize)]
struct EfPage {
    #[serde(default)]
    seq: Option<serde_json::Value>,
    #[serde(default)]
    body: Option<EfBody>,
}

#[derive(Debug, Deserialize)]
struct EfBody {
    #[serde(default, rename = "tokenPosCount")]
    token_pos_count: Option<serde_json::Value>,
}

fn json_scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub fn features_url(htid: &str, cfg: &FeatureApiConfig) -> String {
    let base = cfg.base_url.trim_end_matches('/');
    format!("{}/{}/pages", base, htid)
}

/// Turn an EF API `/pages` response into a `page, words_pos` table.
/// `words_pos` holds the page body's `tokenPosCount` as compact JSON; pages
/// without a body get a missing value.
pub fn parse_features_response(body: &str) -> Result<PageTable, serde_json::Error> {
    let parsed: EfResponse = serde_json::from_str(body)?;
    let mut table = PageTable::new([PAGE_KEY, WORDS_POS_COLUMN]);
    for page in parsed.data.map(|d| d.pages).unwrap_or_default() {
        let seq = page.seq.as_ref().and_then(json_scalar);
        let words = page.body.and_then(|b| b.token_pos_count).as_ref().and_then(|v| match v {
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });
        table.push_row(vec![seq, words]);
    }
    Ok(table)
}

/// GET `<base_url>/<htid>/pages`. Any transport error, non-2xx status or
/// unparsable body is one `RemoteFetchFailure`; nothing is retried.
pub fn fetch_page_features(htid: &str, cfg: &FeatureApiConfig) -> Result<PageTable, FetchError> {
    let url = features_url(htid, cfg);
    let fail = |reason: String| FetchError::RemoteFetchFailure { url: url.clone(), reason };

    let response = ureq::get(&url).timeout(cfg.timeout).call().map_err(|e| match e {
        ureq::Error::Status(code, _) => fail(format!("HTTP status {}", code)),
        other => fail(other.to_string()),
    })?;
    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(fail(format!("HTTP status {}", status)));
    }
    let body = response.into_string().map_err(|e| fail(e.to_string()))?;
    parse_features_response(&body).map_err(|e| fail(format!("invalid response body: {}", e)))
}

/// Copy of `table` with every missing non-key cell replaced by `sentinel`,
/// matching what downstream readers of the features CSV expect on disk.
pub fn fill_missing(table: &PageTable, key: &str, sentinel: &str) -> PageTable {
    let key_idx = table.column_index(key);
    let mut out = table.clone();
    for row in &mut out.rows {
        for (i, cell) in row.iter_mut().enumerate() {
            if Some(i) != key_idx && cell.is_none() {
                *cell = Some(sentinel.to_string());
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Rename only the first non-key column of each table when any name collides.
    #[default]
    FirstColumn,
    /// Rename every non-key column whose name appears in both tables.
    AllColliding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignOptions {
    pub key: String,
    pub sentinels: Vec<String>,
    pub collision: CollisionPolicy,
    pub primary_prefix: String,
    pub secondary_prefix: String,
}

impl Default for AlignOptions {
    fn default() -> Self {
        Self {
            key: PAGE_KEY.to_string(),
            sentinels: vec![NO_BODY_DATA.to_string(), NO_PAGE_DATA.to_string()],
            collision: CollisionPolicy::FirstColumn,
            primary_prefix: "file1_".to_string(),
            secondary_prefix: "file2_".to_string(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AlignError {
    #[error("MissingKeyColumn: {table} table has no '{column}' column")]
    MissingKeyColumn { table: String, column: String },
}

impl AlignError {
    pub fn exit_code(&self) -> i32 {
        5
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnRename {
    pub side: Side,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct Alignment {
    pub table: PageTable,
    pub renamed: Vec<ColumnRename>,
    /// Names still shared by both tables after the collision policy ran;
    /// these got the `_x` / `_y` suffixes.
    pub residual_collisions: Vec<String>,
    /// Sentinel cells in the secondary table turned into missing values.
    pub sentinels_cleared: usize,
    /// Page keys seen more than once in either input.
    pub duplicate_keys: Vec<String>,
    pub sorted_numerically: bool,
}

/// Replace sentinel strings in every non-key column with a missing value.
/// Returns how many cells changed.
pub fn clear_sentinels(table: &mut PageTable, key: &str, sentinels: &[String]) -> usize {
    let key_idx = table.column_index(key);
    let mut cleared = 0;
    for row in &mut table.rows {
        for (i, cell) in row.iter_mut().enumerate() {
            if Some(i) == key_idx {
                continue;
            }
            if cell.as_deref().is_some_and(|v| sentinels.iter().any(|s| s == v)) {
                *cell = None;
                cleared += 1;
            }
        }
    }
    cleared
}

/// Numeric value of a page key, if it has one.
pub fn numeric_key(raw: &str) -> Option<f64> {
    let v = raw.trim().parse::<f64>().ok()?;
    v.is_finite().then_some(v)
}

fn integer_key(raw: &str) -> Option<i128> {
    raw.trim().parse::<i128>().ok()
}

/// Canonical form used only to match keys across tables: `00000002`, `2` and
/// `2.0` are the same page; anything non-numeric matches on its trimmed text.
/// Integers never go through `f64`, so long keys keep every digit.
pub fn canonical_key(raw: Option<&str>) -> String {
    let t = raw.unwrap_or("").trim();
    if let Some(n) = integer_key(t) {
        return n.to_string();
    }
    match numeric_key(t) {
        Some(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", v as i64),
        Some(v) => format!("{}", v),
        None => t.to_string(),
    }
}

fn non_key_columns(table: &PageTable, key_idx: usize) -> Vec<String> {
    table
        .columns
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != key_idx)
        .map(|(_, c)| c.clone())
        .collect()
}

fn rename(names: &mut [String], idx: usize, to: String, side: Side, log: &mut Vec<ColumnRename>) {
    let from = std::mem::replace(&mut names[idx], to.clone());
    log.push(ColumnRename { side, from, to });
}

/// Apply the collision policy to the non-key column names of both tables.
/// Names still shared afterwards get `_x` / `_y` suffixes so no column is lost.
fn resolve_collisions(
    primary: &mut [String],
    secondary: &mut [String],
    opts: &AlignOptions,
) -> (Vec<ColumnRename>, Vec<String>) {
    let mut log = Vec::new();
    match opts.collision {
        CollisionPolicy::FirstColumn => {
            let total = primary.len() + secondary.len();
            let distinct: HashSet<&String> = primary.iter().chain(secondary.iter()).collect();
            if distinct.len() < total {
                if !primary.is_empty() {
                    let to = format!("{}{}", opts.primary_prefix, primary[0]);
                    rename(primary, 0, to, Side::Primary, &mut log);
                }
                if !secondary.is_empty() {
                    let to = format!("{}{}", opts.secondary_prefix, secondary[0]);
                    rename(secondary, 0, to, Side::Secondary, &mut log);
                }
            }
        }
        CollisionPolicy::AllColliding => {
            let shared: HashSet<String> = primary
                .iter()
                .filter(|c| secondary.contains(c))
                .cloned()
                .collect();
            for i in 0..primary.len() {
                if shared.contains(&primary[i]) {
                    let to = format!("{}{}", opts.primary_prefix, primary[i]);
                    rename(primary, i, to, Side::Primary, &mut log);
                }
            }
            for i in 0..secondary.len() {
                if shared.contains(&secondary[i]) {
                    let to = format!("{}{}", opts.secondary_prefix, secondary[i]);
                    rename(secondary, i, to, Side::Secondary, &mut log);
                }
            }
        }
    }

    let mut residual: Vec<String> = Vec::new();
    for c in primary.iter().filter(|c| secondary.contains(c) || **c == opts.key) {
        if !residual.contains(c) {
            residual.push(c.clone());
        }
    }
    for c in secondary.iter().filter(|c| **c == opts.key) {
        if !residual.contains(c) {
            residual.push(c.clone());
        }
    }
    for i in 0..primary.len() {
        if residual.contains(&primary[i]) {
            let to = format!("{}_x", primary[i]);
            rename(primary, i, to, Side::Primary, &mut log);
        }
    }
    for i in 0..secondary.len() {
        if residual.contains(&secondary[i]) {
            let to = format!("{}_y", secondary[i]);
            rename(secondary, i, to, Side::Secondary, &mut log);
        }
    }
    (log, residual)
}

fn duplicate_keys(keys: &[String]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut dups = Vec::new();
    for k in keys {
        let n = counts.entry(k.as_str()).or_insert(0);
        *n += 1;
        if *n == 2 {
            dups.push(k.clone());
        }
    }
    dups
}

/// Full outer join of `primary` and `secondary` on the page key, sorted by page.
///
/// Output columns are the key, then the primary's other columns, then the
/// secondary's. Sentinel values in the secondary become missing before the join.
/// Rows are sorted by numeric page only when every key is numeric; otherwise the
/// join order (primary rows, then unmatched secondary rows) is kept as is.
/// Argument order matters for collision renaming but not for the joined content.
pub fn align_tables(
    primary: &PageTable,
    secondary: &PageTable,
    opts: &AlignOptions,
) -> Result<Alignment, AlignError> {
    let missing = |table: &str| AlignError::MissingKeyColumn { table: table.to_string(), column: opts.key.clone() };
    let p_key = primary.column_index(&opts.key).ok_or_else(|| missing("primary"))?;
    let s_key = secondary.column_index(&opts.key).ok_or_else(|| missing("secondary"))?;

    let mut secondary = secondary.clone();
    let sentinels_cleared = clear_sentinels(&mut secondary, &opts.key, &opts.sentinels);

    let mut p_names = non_key_columns(primary, p_key);
    let mut s_names = non_key_columns(&secondary, s_key);
    let (renamed, residual_collisions) = resolve_collisions(&mut p_names, &mut s_names, opts);

    let p_keys: Vec<String> = primary.rows.iter().map(|r| canonical_key(r.get(p_key).and_then(|c| c.as_deref()))).collect();
    let s_keys: Vec<String> = secondary.rows.iter().map(|r| canonical_key(r.get(s_key).and_then(|c| c.as_deref()))).collect();
    let mut dup = duplicate_keys(&p_keys);
    for k in duplicate_keys(&s_keys) {
        if !dup.contains(&k) {
            dup.push(k);
        }
    }

    let mut by_key: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, k) in s_keys.iter().enumerate() {
        by_key.entry(k.as_str()).or_default().push(i);
    }

    let others = |row: &[Option<String>], key_idx: usize| -> Vec<Option<String>> {
        row.iter().enumerate().filter(|(i, _)| *i != key_idx).map(|(_, c)| c.clone()).collect()
    };

    let mut columns = Vec::with_capacity(1 + p_names.len() + s_names.len());
    columns.push(opts.key.clone());
    columns.extend(p_names.iter().cloned());
    columns.extend(s_names.iter().cloned());
    let mut out = PageTable::new(columns);

    let mut matched = vec![false; secondary.len()];
    for (pi, prow) in primary.rows.iter().enumerate() {
        let key = prow.get(p_key).cloned().flatten();
        let left = others(prow.as_slice(), p_key);
        match by_key.get(p_keys[pi].as_str()) {
            Some(hits) => {
                for &si in hits {
                    matched[si] = true;
                    let mut row = vec![key.clone()];
                    row.extend(left.iter().cloned());
                    row.extend(others(secondary.rows[si].as_slice(), s_key));
                    out.push_row(row);
                }
            }
            None => {
                let mut row = vec![key];
                row.extend(left);
                row.extend(std::iter::repeat(None).take(s_names.len()));
                out.push_row(row);
            }
        }
    }
    for (si, srow) in secondary.rows.iter().enumerate() {
        if matched[si] {
            continue;
        }
        let mut row = vec![srow.get(s_key).cloned().flatten()];
        row.extend(std::iter::repeat(None).take(p_names.len()));
        row.extend(others(srow.as_slice(), s_key));
        out.push_row(row);
    }

    let sorted_numerically = sort_by_numeric_key(&mut out);

    Ok(Alignment {
        table: out,
        renamed,
        residual_collisions,
        sentinels_cleared,
        duplicate_keys: dup,
        sorted_numerically,
    })
}

/// Stable ascending sort on the first column, all or nothing: if any key is not
/// numeric the table is left untouched and `false` is returned.
/// All-integer keys are compared exactly; otherwise as `f64`.
pub fn sort_by_numeric_key(table: &mut PageTable) -> bool {
    let key_text = |r: &Vec<Option<String>>| r.first().and_then(|c| c.as_deref()).map(str::to_string);
    let mut order: Vec<usize> = (0..table.rows.len()).collect();

    let ints: Option<Vec<i128>> = table.rows.iter().map(|r| key_text(r).as_deref().and_then(integer_key)).collect();
    if let Some(ints) = ints {
        order.sort_by_key(|&i| ints[i]);
    } else {
        let floats: Option<Vec<f64>> = table.rows.iter().map(|r| key_text(r).as_deref().and_then(numeric_key)).collect();
        let Some(floats) = floats else {
            return false;
        };
        order.sort_by(|&a, &b| floats[a].total_cmp(&floats[b]));
    }
    let mut rows: Vec<Option<Vec<Option<String>>>> = std::mem::take(&mut table.rows).into_iter().map(Some).collect();
    table.rows = order.into_iter().filter_map(|i| rows[i].take()).collect();
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EfApiSection {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for EfApiSection {
    fn default() -> Self {
        Self { base_url: DEFAULT_EF_API_BASE.to_string(), timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombineSection {
    pub key: String,
    pub collision: CollisionPolicy,
    pub sentinels: Vec<String>,
    pub primary_prefix: String,
    pub secondary_prefix: String,
}

impl Default for CombineSection {
    fn default() -> Self {
        let d = AlignOptions::default();
        Self {
            key: d.key,
            collision: d.collision,
            sentinels: d.sentinels,
            primary_prefix: d.primary_prefix,
            secondary_prefix: d.secondary_prefix,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputsSection {
    pub dir: String,
}

impl Default for OutputsSection {
    fn default() -> Self {
        Self { dir: ".".to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ef_api: EfApiSection,
    pub combine: CombineSection,
    pub outputs: OutputsSection,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        3
    }
}

/// Exit status for command-line misuse.
pub const USAGE_EXIT_CODE: i32 = 2;

/// Read and validate a YAML config file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let cfg: Config = if raw.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
    };
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<(), ConfigError> {
    let base = cfg.ef_api.base_url.trim();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(ConfigError::Invalid(format!("ef_api.base_url must be an http(s) URL, got '{}'", base)));
    }
    if cfg.ef_api.timeout_secs == 0 {
        return Err(ConfigError::Invalid("ef_api.timeout_secs must be > 0".into()));
    }
    if cfg.combine.key.trim().is_empty() {
        return Err(ConfigError::Invalid("combine.key must not be empty".into()));
    }
    if cfg.combine.sentinels.is_empty() {
        return Err(ConfigError::Invalid("combine.sentinels must list at least one value".into()));
    }
    if cfg.combine.primary_prefix == cfg.combine.secondary_prefix {
        return Err(ConfigError::Invalid("combine prefixes must differ".into()));
    }
    Ok(())
}

impl Config {
    /// Apply environment overrides; `lookup` is `std::env::var(..).ok()` in the binary.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(base) = lookup(EF_API_BASE_ENV).filter(|v| !v.trim().is_empty()) {
            self.ef_api.base_url = base;
        }
        self
    }

    pub fn feature_api(&self) -> FeatureApiConfig {
        FeatureApiConfig {
            base_url: self.ef_api.base_url.clone(),
            timeout: Duration::from_secs(self.ef_api.timeout_secs),
        }
    }

    pub fn align_options(&self) -> AlignOptions {
        AlignOptions {
            key: self.combine.key.clone(),
            sentinels: self.combine.sentinels.clone(),
            collision: self.combine.collision,
            primary_prefix: self.combine.primary_prefix.clone(),
            secondary_prefix: self.combine.secondary_prefix.clone(),
        }
    }
}
