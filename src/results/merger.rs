//! Result merger
//!
//! Stitches the per-unit result documents into one consolidated document:
//! suites re-executed by several workers appear exactly once, re-executed
//! tests keep the latest attempt, argument-file variants stay side by
//! side under a synthetic parent, and references to copied artifacts are
//! rewritten to their prefixed names.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, warn};

use super::xml::{read_document, render_document, Element, XmlNode};

/// Test totals of the consolidated document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// What the merge produced.
#[derive(Debug)]
pub struct MergeOutcome {
    pub output_path: PathBuf,
    pub stats: MergeStats,
    /// True when inputs were missing or unreadable; the consolidated
    /// document does not contain every test that was supposed to run.
    pub incomplete: bool,
}

/// Merge every result document under `results_dir` into
/// `outputdir/output.xml`.
pub fn merge_results(
    results_dir: &Path,
    outputdir: &Path,
    root_name: &str,
    argfile_indexes: &[String],
    copied_artifacts: &[String],
) -> Result<MergeOutcome> {
    let mut files = Vec::new();
    collect_xml_files(results_dir, &mut files);
    files.sort();

    let mut incomplete = !missing_output_units(results_dir).is_empty();
    let patterns = artifact_patterns(copied_artifacts);

    // Argument-file variants are merged apart from each other and kept as
    // sibling trees in the final document.
    let mut variants: BTreeMap<String, Vec<(String, Element)>> = BTreeMap::new();
    let mut robot_attrs: Option<Vec<(String, String)>> = None;

    for file in &files {
        let mut doc = match read_document(file) {
            Ok(doc) => doc,
            Err(err) => {
                warn!("skipping '{}' from final result: {err:#}", file.display());
                incomplete = true;
                continue;
            }
        };
        let prefix = unit_prefix(results_dir, file);
        rewrite_artifact_refs(&mut doc, &prefix, &patterns);

        if robot_attrs.is_none() {
            robot_attrs = Some(doc.attributes.clone());
        }
        let variant = variant_of(&prefix, argfile_indexes);
        let suites = doc
            .children
            .into_iter()
            .filter_map(|node| match node {
                XmlNode::Element(e) if e.name == "suite" => Some(e),
                _ => None,
            })
            .collect::<Vec<_>>();
        let bucket = variants.entry(variant).or_default();
        for suite in suites {
            let name = suite.attr("name").unwrap_or_default().to_string();
            match bucket.iter_mut().find(|(n, _)| *n == name) {
                Some((_, base)) => merge_suite_trees(base, suite),
                None => bucket.push((name, suite)),
            }
        }
    }

    let mut merged: Vec<Element> = variants
        .into_values()
        .flat_map(|bucket| bucket.into_iter().map(|(_, suite)| suite))
        .collect();

    let mut robot = Element::new("robot");
    robot.attributes = robot_attrs.unwrap_or_default();
    let execution_count = files.len();
    match merged.len() {
        0 => {
            warn!("no result documents in '{}'", results_dir.display());
            incomplete = true;
        }
        1 => {
            let mut suite = merged.remove(0);
            if suite.first_named("doc").is_none() {
                let mut doc = Element::new("doc");
                doc.set_text(format!("Pabot result from {execution_count} executions."));
                suite.children.insert(0, XmlNode::Element(doc));
            }
            robot.push_element(suite);
        }
        _ => {
            let mut parent = Element::new("suite");
            let name = if root_name.is_empty() { "Suites" } else { root_name };
            parent.set_attr("name", name);
            for suite in merged {
                parent.push_element(suite);
            }
            robot.push_element(parent);
        }
    }

    let stats = count_stats(&robot);
    fs::create_dir_all(outputdir)
        .with_context(|| format!("failed to create {}", outputdir.display()))?;
    let output_path = outputdir.join("output.xml");
    let rendered = render_document(&robot)?;
    fs::write(&output_path, rendered)
        .with_context(|| format!("failed to write {}", output_path.display()))?;
    info!("Output:  {}", output_path.display());

    Ok(MergeOutcome {
        output_path,
        stats,
        incomplete,
    })
}

/// Unit scratch directories that captured runner output but produced no
/// result document; each entry points at the captured stderr file.
pub fn missing_output_units(results_dir: &Path) -> Vec<PathBuf> {
    let mut missing = Vec::new();
    let mut dirs = vec![results_dir.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut has_xml = false;
        let mut stderr_file = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else if path.extension().is_some_and(|e| e == "xml") {
                has_xml = true;
            } else if path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with("_stderr.out"))
            {
                stderr_file = Some(path);
            }
        }
        if let Some(stderr_file) = stderr_file {
            if !has_xml {
                missing.push(stderr_file);
            }
        }
    }
    missing.sort();
    missing
}

fn collect_xml_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_xml_files(&path, out);
        } else if path.extension().is_some_and(|e| e == "xml") {
            out.push(path);
        }
    }
}

/// First path component of the result file below the results directory.
/// It names the unit scratch directory and prefixes copied artifacts.
fn unit_prefix(results_dir: &Path, file: &Path) -> String {
    file.strip_prefix(results_dir)
        .ok()
        .and_then(|rel| rel.components().next())
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn variant_of(prefix: &str, argfile_indexes: &[String]) -> String {
    if argfile_indexes.iter().any(|i| i == prefix) {
        prefix.to_string()
    } else {
        String::new()
    }
}

/// Merge `other` into `base`, both being `<suite>` elements of the same
/// name. Child suites merge recursively; a re-executed test is replaced
/// by the later attempt; suite status spans widen to cover both runs.
fn merge_suite_trees(base: &mut Element, other: Element) {
    for node in other.children {
        let XmlNode::Element(child) = node else {
            continue;
        };
        match child.name.as_str() {
            "suite" => {
                let name = child.attr("name").unwrap_or_default().to_string();
                let existing = base.children.iter().position(|n| {
                    matches!(n, XmlNode::Element(e)
                        if e.name == "suite" && e.attr("name") == Some(name.as_str()))
                });
                match existing {
                    Some(position) => {
                        if let XmlNode::Element(e) = &mut base.children[position] {
                            merge_suite_trees(e, child);
                        }
                    }
                    None => base.push_element(child),
                }
            }
            "test" => {
                let name = child.attr("name").unwrap_or_default().to_string();
                match base
                    .children
                    .iter_mut()
                    .position(|n| matches!(n, XmlNode::Element(e) if e.name == "test" && e.attr("name") == Some(name.as_str())))
                {
                    // The later attempt wins.
                    Some(position) => base.children[position] = XmlNode::Element(child),
                    None => base.push_element(child),
                }
            }
            "status" => {
                let existing = base
                    .children
                    .iter()
                    .position(|n| matches!(n, XmlNode::Element(e) if e.name == "status"));
                match existing {
                    Some(position) => {
                        if let XmlNode::Element(e) = &mut base.children[position] {
                            widen_status(e, &child);
                        }
                    }
                    None => base.push_element(child),
                }
            }
            other_name => {
                let other_name = other_name.to_string();
                if base.elements().all(|e| e.name != other_name) {
                    base.push_element(child);
                }
            }
        }
    }
}

/// Runner timestamps sort lexicographically, so min/max on the raw
/// strings widens the covered time span.
fn widen_status(base: &mut Element, other: &Element) {
    if let (Some(a), Some(b)) = (base.attr("starttime"), other.attr("starttime")) {
        if b < a {
            let b = b.to_string();
            base.set_attr("starttime", b);
        }
    }
    if let (Some(a), Some(b)) = (base.attr("endtime"), other.attr("endtime")) {
        if b > a {
            let b = b.to_string();
            base.set_attr("endtime", b);
        }
    }
    if other.attr("status") == Some("FAIL") {
        base.set_attr("status", "FAIL");
    }
}

fn artifact_patterns(copied: &[String]) -> Vec<Regex> {
    let mut names: Vec<&String> = copied.iter().collect();
    names.sort();
    names.dedup();
    names
        .iter()
        .map(|name| {
            Regex::new(&format!(
                r#"(src|href)="([^"]*[\\/])?({})""#,
                regex::escape(name)
            ))
            .expect("escaped artifact pattern is valid")
        })
        .collect()
}

/// Rewrite artifact references in message text: paths that escaped the
/// unit directory are flattened and copied artifact names get their unit
/// prefix.
fn rewrite_artifact_refs(element: &mut Element, prefix: &str, patterns: &[Regex]) {
    for node in element.children.iter_mut() {
        match node {
            XmlNode::Element(child) => rewrite_artifact_refs(child, prefix, patterns),
            XmlNode::Text(text) => {
                if !text.contains("src=") && !text.contains("href=") {
                    continue;
                }
                let mut updated = text.replace(r#"src="../../"#, r#"src=""#);
                updated = updated.replace(r#"href="../../"#, r#"href=""#);
                for pattern in patterns {
                    updated = pattern
                        .replace_all(&updated, format!(r#"${{1}}="${{2}}{prefix}-${{3}}""#))
                        .into_owned();
                }
                *text = updated;
            }
        }
    }
}

fn count_stats(robot: &Element) -> MergeStats {
    let mut stats = MergeStats::default();
    count_into(robot, &mut stats);
    stats
}

fn count_into(element: &Element, stats: &mut MergeStats) {
    for child in element.elements() {
        if child.name == "test" {
            stats.total += 1;
            match child.first_named("status").and_then(|s| s.attr("status")) {
                Some("PASS") => stats.passed += 1,
                Some("SKIP") => stats.skipped += 1,
                _ => stats.failed += 1,
            }
        }
        count_into(child, stats);
    }
}
