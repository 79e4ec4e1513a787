//! Suite and test discovery
//!
//! Resolves the user's datasources and filters into the canonical unit
//! list by running the underlying runner in dry-run mode, then caches the
//! outcome in `.pabotsuitenames` so later invocations skip the listing
//! subprocess entirely.

mod cache;

pub use cache::{load_cache, store_cache, Fingerprints, LoadedCache, CACHE_FILE_NAME};

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cli::Settings;
use crate::plan::{parse_items, Plan, PlanError, PlanItem, Unit, UnitKind};
use crate::results::xml::{read_document, Element};

/// A leaf suite reported by the runner's dry-run listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredSuite {
    /// Fully qualified dotted name.
    pub name: String,
    /// Fully qualified test names, in document order.
    pub tests: Vec<String>,
}

/// Resolve the full execution plan for this invocation, with the cache
/// kept in `dir`.
pub async fn resolve_plan(dir: &Path, settings: &Settings) -> Result<Plan> {
    let fingerprints = Fingerprints::compute(settings);

    // Pre-run modifiers may change the unit list arbitrarily, so a cached
    // listing cannot be trusted while one is active.
    let cached = if settings.prerunmodifier.is_some() {
        None
    } else {
        load_cache(dir, &fingerprints)
    };

    let mut items = match cached {
        Some(cached) => {
            debug!("using cached unit list from {CACHE_FILE_NAME}");
            cached.items
        }
        None => {
            let stale = stale_cache_items(dir);
            let suites = list_units(settings).await?;
            let mut units = split_levels(suites, settings.testlevelsplit, &stale);
            if let Some(suitesfrom) = &settings.suitesfrom {
                if suitesfrom.is_file() {
                    let doc = read_document(suitesfrom)?;
                    units = order_from_previous(units, &doc);
                }
            }
            let units = apply_previous_order(units, &stale, false)?;
            if let Err(err) = store_cache(dir, &fingerprints, &units) {
                warn!("storing {CACHE_FILE_NAME} failed: {err:#}");
            }
            units
        }
    };

    if let Some(ordering_path) = &settings.ordering {
        let text = std::fs::read_to_string(ordering_path)
            .with_context(|| format!("failed to read ordering file {}", ordering_path.display()))?;
        let ordering = parse_items(&text)?;
        check_ordering(&ordering, &items)?;
        items = apply_previous_order(items, &ordering, true)?;
    }

    if let Some((index, count)) = settings.shard {
        items = shard_slice(items, index, count)?;
    }

    if settings.chunk {
        let budget = settings.worker_budget(items.len());
        items = chunk_into_groups(items, budget);
    }

    let plan = Plan::build(items)?;
    info!("resolved {} executable unit(s)", plan.dispatch_count());
    Ok(plan)
}

/// Items of an existing cache regardless of fingerprint validity. Used to
/// preserve ordering and explicit level choices across regeneration.
fn stale_cache_items(dir: &Path) -> Vec<PlanItem> {
    let path = dir.join(CACHE_FILE_NAME);
    let Ok(content) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    let body: String = content.lines().skip(4).collect::<Vec<_>>().join("\n");
    parse_items(&body).unwrap_or_default()
}

/// Run the underlying runner in dry-run mode and read the listing it
/// produces.
pub async fn list_units(settings: &Settings) -> Result<Vec<DiscoveredSuite>> {
    let scratch = tempfile::tempdir().context("failed to create discovery scratch dir")?;
    let listing = scratch.path().join("suite_names.xml");

    let (program, base_args) = settings
        .command
        .split_first()
        .context("runner command is empty")?;
    let listing_arg = listing.to_string_lossy().into_owned();
    let mut command = Command::new(program);
    command.args(base_args);
    command.args([
        "--dryrun",
        "--output",
        listing_arg.as_str(),
        "--log",
        "NONE",
        "--report",
        "NONE",
        "--xunit",
        "NONE",
        "--consolecolors",
        "off",
    ]);
    if let Some(modifier) = &settings.prerunmodifier {
        command.args(["--prerunmodifier", modifier.as_str()]);
    }
    command.args(&settings.runner_args);
    command.args(settings.datasources.iter().map(|p| p.as_os_str()));
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("running discovery: {program} --dryrun ...");
    let output = command
        .output()
        .await
        .with_context(|| format!("failed to start runner '{program}' for discovery"))?;

    if !listing.is_file() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "discovery produced no listing (runner exited with {}): {}",
            output.status,
            stderr.trim()
        );
    }

    let doc = read_document(&listing)?;
    let mut suites = Vec::new();
    collect_leaf_suites(&doc, "", &mut suites);
    suites.sort_by(|a, b| a.name.cmp(&b.name));
    suites.dedup_by(|a, b| a.name == b.name);
    Ok(suites)
}

fn collect_leaf_suites(element: &Element, prefix: &str, out: &mut Vec<DiscoveredSuite>) {
    for suite in element.elements_named("suite") {
        let Some(name) = suite.attr("name") else {
            continue;
        };
        let longname = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        };
        let tests: Vec<String> = suite
            .elements_named("test")
            .filter_map(|t| t.attr("name"))
            .map(|t| format!("{longname}.{t}"))
            .collect();
        if !tests.is_empty() {
            out.push(DiscoveredSuite {
                name: longname.clone(),
                tests,
            });
        }
        collect_leaf_suites(suite, &longname, out);
    }
}

/// Expand suites into tests under `--testlevelsplit`, keeping a suite
/// intact when an earlier cache listed it explicitly at suite level.
fn split_levels(
    suites: Vec<DiscoveredSuite>,
    testlevelsplit: bool,
    previous: &[PlanItem],
) -> Vec<PlanItem> {
    if !testlevelsplit {
        return suites
            .into_iter()
            .map(|s| PlanItem::Unit(Unit::suite(s.name)))
            .collect();
    }
    let explicit_suites: HashSet<&str> = previous
        .iter()
        .filter_map(|item| match item {
            PlanItem::Unit(unit) if unit.kind == UnitKind::Suite => Some(unit.name.as_str()),
            _ => None,
        })
        .collect();
    let mut items = Vec::new();
    for suite in suites {
        if explicit_suites.contains(suite.name.as_str()) {
            items.push(PlanItem::Unit(Unit::suite(suite.name)));
        } else {
            items.extend(suite.tests.into_iter().map(|t| PlanItem::Unit(Unit::test(t))));
        }
    }
    items
}

/// Reorder units by a previous result file: failed units first, then the
/// rest by previously observed duration, longest first.
fn order_from_previous(units: Vec<PlanItem>, previous: &Element) -> Vec<PlanItem> {
    let mut stats = Vec::new();
    collect_suite_stats(previous, "", &mut stats);

    let mut keyed: Vec<(usize, i64, PlanItem)> = Vec::with_capacity(units.len());
    for item in units {
        let (failed, elapsed) = match &item {
            PlanItem::Unit(unit) => stats
                .iter()
                .find(|(name, _, _)| unit.name == *name || unit.name.starts_with(&format!("{name}.")))
                .map(|(_, failed, elapsed)| (*failed, *elapsed))
                .unwrap_or((false, 0)),
            _ => (false, 0),
        };
        // Failed units sort ahead of passing ones, longest first within
        // each band.
        let band = usize::from(!failed);
        keyed.push((band, -elapsed, item));
    }
    keyed.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    keyed.into_iter().map(|(_, _, item)| item).collect()
}

/// (suite longname, any test failed, elapsed milliseconds)
fn collect_suite_stats(element: &Element, prefix: &str, out: &mut Vec<(String, bool, i64)>) {
    for suite in element.elements_named("suite") {
        let Some(name) = suite.attr("name") else {
            continue;
        };
        let longname = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        };
        let tests: Vec<&Element> = suite.elements_named("test").collect();
        if !tests.is_empty() {
            let failed = tests.iter().any(|t| {
                t.first_named("status")
                    .map(|s| s.attr("status") == Some("FAIL"))
                    .unwrap_or(true)
            });
            let elapsed = suite
                .first_named("status")
                .map(status_elapsed_ms)
                .unwrap_or(0);
            out.push((longname.clone(), failed, elapsed));
        }
        collect_suite_stats(suite, &longname, out);
    }
}

fn status_elapsed_ms(status: &Element) -> i64 {
    if let Some(elapsed) = status.attr("elapsed") {
        if let Ok(secs) = elapsed.parse::<f64>() {
            return (secs * 1000.0) as i64;
        }
    }
    let parse = |v: &str| NaiveDateTime::parse_from_str(v, "%Y%m%d %H:%M:%S%.3f").ok();
    match (
        status.attr("starttime").and_then(parse),
        status.attr("endtime").and_then(parse),
    ) {
        (Some(start), Some(end)) => (end - start).num_milliseconds(),
        _ => 0,
    }
}

/// Cross-check an `--ordering` file against the discovered unit list.
fn check_ordering(ordering: &[PlanItem], discovered: &[PlanItem]) -> Result<(), PlanError> {
    let units: Vec<&Unit> = discovered
        .iter()
        .filter_map(|item| match item {
            PlanItem::Unit(unit) => Some(unit),
            _ => None,
        })
        .collect();
    let mut runnables = 0usize;
    for item in ordering {
        if let PlanItem::Unit(ordered) = item {
            runnables += 1;
            if !units.iter().any(|u| unit_names_match(u, ordered)) {
                return Err(PlanError::UnmatchedOrdering(ordered.name.clone()));
            }
        }
    }
    if runnables > units.len() {
        return Err(PlanError::OversizedOrdering);
    }
    Ok(())
}

fn unit_names_match(discovered: &Unit, ordered: &Unit) -> bool {
    discovered.matches_name(&ordered.name) || ordered.matches_name(&discovered.name)
}

/// Merge a previous sequence into the discovered one: previous items that
/// still exist keep their position and annotations, discovered units
/// missing from it are appended in discovery order.
///
/// With `strict` set, a previous runnable without a discovered match is an
/// error (`--ordering` case); otherwise it is silently dropped (stale
/// cache case).
fn apply_previous_order(
    discovered: Vec<PlanItem>,
    previous: &[PlanItem],
    strict: bool,
) -> Result<Vec<PlanItem>, PlanError> {
    if previous.is_empty() {
        return Ok(discovered);
    }
    let mut units: Vec<Option<Unit>> = discovered
        .iter()
        .filter_map(|item| match item {
            PlanItem::Unit(unit) => Some(Some(unit.clone())),
            _ => None,
        })
        .collect();

    let mut result = Vec::new();
    for item in previous {
        match item {
            PlanItem::Unit(ordered) => {
                let slot = units.iter_mut().find(
                    |u| matches!(u, Some(unit) if unit_names_match(unit, ordered)),
                );
                match slot {
                    Some(slot) => {
                        let unit = slot.take().expect("matched slot is occupied");
                        let mut merged = ordered.clone();
                        // The discovered side owns the canonical name and
                        // kind; the previous side owns the annotations.
                        merged.name = unit.name;
                        merged.kind = unit.kind;
                        result.push(PlanItem::Unit(merged));
                    }
                    None if strict => {
                        return Err(PlanError::UnmatchedOrdering(ordered.name.clone()))
                    }
                    None => {}
                }
            }
            marker => result.push(marker.clone()),
        }
    }
    for unit in units.into_iter().flatten() {
        result.push(PlanItem::Unit(unit));
    }
    Ok(result)
}

/// Keep only the `index`-th of `count` near-equal slices (1-based).
fn shard_slice(items: Vec<PlanItem>, index: usize, count: usize) -> Result<Vec<PlanItem>> {
    if count <= 1 {
        return Ok(items);
    }
    if items.len() < count {
        bail!(
            "not enough units ({}) for shard count ({count})",
            items.len()
        );
    }
    let q = items.len() / count;
    let r = items.len() % count;
    let start = (index - 1) * q + (index - 1).min(r);
    let end = index * q + index.min(r);
    Ok(items[start..end].to_vec())
}

/// Pack all runnable items into at most `processes` sequential groups.
/// Wait barriers and existing groups are dissolved; chunking replaces any
/// hand-written structure.
fn chunk_into_groups(items: Vec<PlanItem>, processes: usize) -> Vec<PlanItem> {
    let units: Vec<Unit> = items
        .into_iter()
        .filter_map(|item| match item {
            PlanItem::Unit(unit) => Some(unit),
            _ => None,
        })
        .collect();
    if units.is_empty() {
        return Vec::new();
    }
    let processes = processes.max(1);
    let q = units.len() / processes;
    let r = units.len() % processes;
    let mut result = Vec::new();
    let mut cursor = 0usize;
    for index in 0..processes {
        let size = q + usize::from(index < r);
        if size == 0 {
            continue;
        }
        let chunk = &units[cursor..cursor + size];
        cursor += size;
        if chunk.len() == 1 {
            result.push(PlanItem::Unit(chunk[0].clone()));
        } else {
            result.push(PlanItem::GroupStart);
            result.extend(chunk.iter().cloned().map(PlanItem::Unit));
            result.push(PlanItem::GroupEnd);
        }
    }
    result
}
