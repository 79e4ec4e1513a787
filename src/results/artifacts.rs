//! Artifact collection
//!
//! After workers exit, files matching the configured extensions are
//! copied from the per-unit scratch directories into the consolidated
//! output directory. Copies are prefixed with the scratch subdirectory
//! name so same-named artifacts from different units cannot collide; the
//! merger uses the same prefix when rewriting references.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Copy matching artifacts and return the original file names of
/// everything copied (the merger builds its rewrite patterns from them).
pub fn copy_artifacts(
    results_dir: &Path,
    outputdir: &Path,
    extensions: &[String],
    include_subfolders: bool,
) -> Result<Vec<String>> {
    let mut copied = Vec::new();
    if !results_dir.is_dir() {
        return Ok(copied);
    }
    let mut files = Vec::new();
    collect_files(results_dir, &mut files)?;
    files.sort();

    for file in files {
        let Some(extension) = file.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !extensions.iter().any(|e| e.eq_ignore_ascii_case(extension)) {
            continue;
        }
        let relative = file
            .parent()
            .and_then(|p| p.strip_prefix(results_dir).ok())
            .unwrap_or_else(|| Path::new(""));
        let mut components = relative.components();
        let Some(prefix) = components.next() else {
            continue;
        };
        let prefix = prefix.as_os_str().to_string_lossy().into_owned();
        let subfolder: PathBuf = components.collect();

        let destination_dir = if subfolder.as_os_str().is_empty() {
            outputdir.to_path_buf()
        } else {
            if !include_subfolders {
                continue;
            }
            outputdir.join(&subfolder)
        };
        fs::create_dir_all(&destination_dir).with_context(|| {
            format!("failed to create artifact dir {}", destination_dir.display())
        })?;

        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let destination = destination_dir.join(format!("{prefix}-{file_name}"));
        fs::copy(&file, &destination).with_context(|| {
            format!(
                "failed to copy artifact {} to {}",
                file.display(),
                destination.display()
            )
        })?;
        debug!("copied artifact {} -> {}", file.display(), destination.display());
        copied.push(file_name);
    }
    Ok(copied)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .flatten()
    {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn extensions() -> Vec<String> {
        vec!["png".to_string()]
    }

    #[test]
    fn copies_with_unit_prefix() {
        let root = tempdir().unwrap();
        let results = root.path().join("pabot_results");
        let out = root.path().join("out");
        fs::create_dir_all(results.join("0")).unwrap();
        fs::create_dir_all(results.join("1")).unwrap();
        fs::write(results.join("0/shot.png"), "a").unwrap();
        fs::write(results.join("1/shot.png"), "b").unwrap();
        fs::write(results.join("0/output.xml"), "<robot/>").unwrap();

        let copied = copy_artifacts(&results, &out, &extensions(), false).unwrap();
        assert_eq!(copied, vec!["shot.png", "shot.png"]);
        assert_eq!(fs::read_to_string(out.join("0-shot.png")).unwrap(), "a");
        assert_eq!(fs::read_to_string(out.join("1-shot.png")).unwrap(), "b");
        assert!(!out.join("0-output.xml").exists());
    }

    #[test]
    fn subfolders_are_skipped_unless_requested() {
        let root = tempdir().unwrap();
        let results = root.path().join("pabot_results");
        let out = root.path().join("out");
        fs::create_dir_all(results.join("0/screenshots")).unwrap();
        fs::write(results.join("0/screenshots/deep.png"), "x").unwrap();

        let copied = copy_artifacts(&results, &out, &extensions(), false).unwrap();
        assert!(copied.is_empty());

        let copied = copy_artifacts(&results, &out, &extensions(), true).unwrap();
        assert_eq!(copied, vec!["deep.png"]);
        assert!(out.join("screenshots/0-deep.png").is_file());
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let root = tempdir().unwrap();
        let results = root.path().join("pabot_results");
        let out = root.path().join("out");
        fs::create_dir_all(results.join("2")).unwrap();
        fs::write(results.join("2/TRACE.PNG"), "x").unwrap();

        let copied = copy_artifacts(&results, &out, &extensions(), false).unwrap();
        assert_eq!(copied, vec!["TRACE.PNG"]);
    }

    #[test]
    fn missing_results_dir_is_empty() {
        let root = tempdir().unwrap();
        let copied = copy_artifacts(
            &root.path().join("nope"),
            &root.path().join("out"),
            &extensions(),
            false,
        )
        .unwrap();
        assert!(copied.is_empty());
    }
}
