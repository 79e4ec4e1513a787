//! Discovery cache (`.pabotsuitenames`)
//!
//! Four opaque fingerprint lines followed by plan items, one per line:
//!
//! ```text
//! datasources:<hex>
//! commandlineoptions:<hex>
//! suitesfrom:<hex>
//! file:<hex>
//! --suite Root.A
//! ...
//! ```
//!
//! Any fingerprint mismatch invalidates the cache. The file is written
//! atomically (temp file + rename) and round-trips text-for-text.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::cli::Settings;
use crate::plan::{parse_items, PlanItem};

pub const CACHE_FILE_NAME: &str = ".pabotsuitenames";

/// File extensions that contribute to the datasource fingerprint.
const DATA_EXTENSIONS: &[&str] = &[
    "html", "htm", "xhtml", "tsv", "rst", "rest", "txt", "robot",
];

/// The three input fingerprints stored in the cache header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprints {
    pub datasources: String,
    pub command: String,
    pub suitesfrom: String,
}

impl Fingerprints {
    /// Compute fingerprints for the current invocation.
    pub fn compute(settings: &Settings) -> Self {
        Self {
            datasources: hash_datasources(&settings.datasources),
            command: hash_command(settings),
            suitesfrom: hash_suitesfrom(settings.suitesfrom.as_deref()),
        }
    }
}

/// A cache successfully read from disk.
#[derive(Debug)]
pub struct LoadedCache {
    pub fingerprints: Fingerprints,
    pub items: Vec<PlanItem>,
}

fn hex(digest: impl AsRef<[u8]>) -> String {
    digest.as_ref().iter().map(|b| format!("{b:02x}")).collect()
}

fn hash_datasources(paths: &[PathBuf]) -> String {
    let mut hasher = Sha256::new();
    for path in paths {
        hash_path(&mut hasher, path);
    }
    hex(hasher.finalize())
}

fn hash_path(hasher: &mut Sha256, path: &Path) {
    if path.is_file() {
        hasher.update(normalized(path).as_bytes());
        hash_file(hasher, path);
        return;
    }
    let Ok(entries) = fs::read_dir(path) else {
        // Unreadable paths still contribute their name so a permissions
        // change is visible as a different fingerprint.
        hasher.update(normalized(path).as_bytes());
        return;
    };
    let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    children.sort();
    for child in children {
        if child.is_dir() {
            hash_path(hasher, &child);
        } else if has_data_extension(&child) {
            hasher.update(normalized(child.parent().unwrap_or(path)).as_bytes());
            hasher.update(child.file_name().unwrap_or_default().as_encoded_bytes());
            hash_file(hasher, &child);
        }
    }
}

fn has_data_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| DATA_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn normalized(path: &Path) -> String {
    let text = path.to_string_lossy();
    text.replace('\\', "/")
}

fn hash_file(hasher: &mut Sha256, path: &Path) {
    if let Ok(content) = fs::read(path) {
        hasher.update(&content);
    }
}

fn hash_command(settings: &Settings) -> String {
    let mut hasher = Sha256::new();
    for part in &settings.command {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    for arg in filtered_runner_args(&settings.runner_args) {
        hasher.update(arg.as_bytes());
        hasher.update([0]);
    }
    if settings.testlevelsplit {
        hasher.update(b"testlevelsplit");
    }
    hex(hasher.finalize())
}

/// Output-placement options do not change which units exist, so they are
/// excluded from the command fingerprint.
fn filtered_runner_args(args: &[String]) -> Vec<&String> {
    const IGNORED: &[&str] = &[
        "--outputdir", "-d", "--output", "-o", "--log", "-l", "--report", "-r", "--xunit",
    ];
    let mut result = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if IGNORED.contains(&arg.as_str()) {
            let _ = iter.next();
        } else {
            result.push(arg);
        }
    }
    result
}

fn hash_suitesfrom(path: Option<&Path>) -> String {
    match path {
        None => "no-suites-from-option".to_string(),
        Some(path) => {
            let mut hasher = Sha256::new();
            hash_file(&mut hasher, path);
            hex(hasher.finalize())
        }
    }
}

/// Hash over the header and an order-insensitive fold of the body lines.
/// Structural markers are excluded so that reordering units invalidates
/// the file hash but moving a `#WAIT` alone does not mask corruption.
fn file_hash(fingerprints: &Fingerprints, body: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("datasources:{}", fingerprints.datasources).as_bytes());
    hasher.update(format!("commandlineoptions:{}", fingerprints.command).as_bytes());
    hasher.update(format!("suitesfrom:{}", fingerprints.suitesfrom).as_bytes());
    let mut folded = [0u8; 32];
    for line in body {
        if matches!(line.as_str(), "#WAIT" | "{" | "}") {
            continue;
        }
        let line_digest = Sha256::digest(line.as_bytes());
        for (acc, byte) in folded.iter_mut().zip(line_digest.iter()) {
            *acc ^= byte;
        }
    }
    hasher.update(folded);
    hex(hasher.finalize())
}

/// Read the cache and validate it against `current`. Returns `None` when
/// the file is absent, corrupted or stale.
pub fn load_cache(dir: &Path, current: &Fingerprints) -> Option<LoadedCache> {
    let path = dir.join(CACHE_FILE_NAME);
    let content = fs::read_to_string(&path).ok()?;
    let lines: Vec<String> = content.lines().map(|l| l.trim().to_string()).collect();
    if lines.len() < 4 {
        warn!("{CACHE_FILE_NAME} is too short; ignoring it");
        return None;
    }
    let stored = Fingerprints {
        datasources: lines[0].strip_prefix("datasources:")?.to_string(),
        command: lines[1].strip_prefix("commandlineoptions:")?.to_string(),
        suitesfrom: lines[2].strip_prefix("suitesfrom:")?.to_string(),
    };
    let stored_file_hash = lines[3].strip_prefix("file:")?.to_string();
    let body = &lines[4..];

    if !crate::plan::body_is_wellformed(body) {
        warn!("{CACHE_FILE_NAME} is corrupted; regenerating");
        return None;
    }
    if stored_file_hash != file_hash(&stored, body) {
        warn!("{CACHE_FILE_NAME} was edited by hand; regenerating");
        return None;
    }

    let items = parse_items(&body.join("\n")).ok()?;
    let cache = LoadedCache {
        fingerprints: stored,
        items,
    };
    if cache.fingerprints != *current {
        debug!("{CACHE_FILE_NAME} fingerprints differ from current inputs");
        return None;
    }
    Some(cache)
}

/// Write the cache atomically into `dir`.
pub fn store_cache(dir: &Path, fingerprints: &Fingerprints, items: &[PlanItem]) -> Result<()> {
    let body: Vec<String> = items.iter().map(PlanItem::line).collect();
    let path = dir.join(CACHE_FILE_NAME);

    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    writeln!(file, "datasources:{}", fingerprints.datasources)?;
    writeln!(file, "commandlineoptions:{}", fingerprints.command)?;
    writeln!(file, "suitesfrom:{}", fingerprints.suitesfrom)?;
    writeln!(file, "file:{}", file_hash(fingerprints, &body))?;
    for line in &body {
        writeln!(file, "{line}")?;
    }
    file.persist(&path)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    debug!("stored {}", path.display());
    Ok(())
}
