//! Source file discovery for the code review and refactor actions

use crate::config::AppConfig;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A reviewable file under the project root
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceFile {
    /// Path relative to the project root, with `/` separators
    pub relative: String,
    pub absolute: PathBuf,
}

/// Expand the configured review paths into a sorted, de-duplicated file list.
///
/// Missing paths are skipped with a warning.
pub fn collect_source_files(config: &AppConfig) -> Vec<SourceFile> {
    let root = &config.project_root;
    let mut files = BTreeSet::new();

    for entry in &config.review_paths {
        let path = root.join(entry);

        if path.is_file() {
            if config.is_reviewable(&path) {
                files.insert(source_file(root, path));
            }
            continue;
        }

        if !path.is_dir() {
            tracing::warn!("Review path {:?} does not exist", path);
            continue;
        }

        let walker = WalkDir::new(&path)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_ignored_dir(e.path(), e.file_type().is_dir(), config));

        for entry in walker.filter_map(|e| e.ok()) {
            if entry.file_type().is_file() && config.is_reviewable(entry.path()) {
                files.insert(source_file(root, entry.into_path()));
            }
        }
    }

    files.into_iter().collect()
}

fn is_ignored_dir(path: &Path, is_dir: bool, config: &AppConfig) -> bool {
    is_dir
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|name| config.ignore_dirs.iter().any(|ignored| ignored == name))
            .unwrap_or(false)
}

fn source_file(root: &Path, absolute: PathBuf) -> SourceFile {
    let relative = absolute
        .strip_prefix(root)
        .unwrap_or(&absolute)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");

    SourceFile { relative, absolute }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_reviewable_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for rel in ["src/b.rs", "src/a.rs", "src/notes.md", "src/target/gen.rs", "tool.py"] {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, "x").unwrap();
        }

        let config = AppConfig {
            project_root: root.to_path_buf(),
            review_paths: vec![
                "src".to_string(),
                "tool.py".to_string(),
                "src/a.rs".to_string(),
                "missing".to_string(),
            ],
            ..AppConfig::default()
        };

        let files: Vec<_> = collect_source_files(&config)
            .into_iter()
            .map(|f| f.relative)
            .collect();
        assert_eq!(files, vec!["src/a.rs", "src/b.rs", "tool.py"]);
    }
}
