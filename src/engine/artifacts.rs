//! Artifact collection and rehydration.
//!
//! Patterns are evaluated against the step's build directory only. A
//! pattern that tries to escape it (`~/...`, an absolute path, or a `..`
//! component) is silently excluded; a pattern that matches nothing is a
//! warning. Matched files are copied preserving their relative path and
//! mode, first into the step's artifact store and later into the build
//! directories of subsequent steps.
//!
//! Matching is `/`-component-wise: `*` and `?` match within one
//! component (hidden files included), `**` matches zero or more
//! components. A pattern that names a directory matches nothing; only
//! files are collected. Symlinks are followed; dangling links are
//! skipped with a warning.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// True when a pattern must be ignored because it could escape the build
/// directory.
pub fn pattern_is_excluded(pattern: &str) -> bool {
    pattern.starts_with('~')
        || pattern.starts_with('/')
        || pattern.split('/').any(|component| component == "..")
}

/// Matches a relative `/`-separated path against a glob pattern.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let path: Vec<&str> = path.split('/').collect();

    match_components(&pattern, &path)
}

fn match_components(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(&"**") => (0..=path.len()).any(|skip| match_components(&pattern[1..], &path[skip..])),
        Some(component) => {
            !path.is_empty()
                && match_segment(component, path[0])
                && match_components(&pattern[1..], &path[1..])
        }
    }
}

fn match_segment(pattern: &str, segment: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let segment: Vec<char> = segment.chars().collect();

    match_chars(&pattern, &segment)
}

fn match_chars(pattern: &[char], segment: &[char]) -> bool {
    match pattern.first() {
        None => segment.is_empty(),
        Some('*') => (0..=segment.len()).any(|skip| match_chars(&pattern[1..], &segment[skip..])),
        Some('?') => !segment.is_empty() && match_chars(&pattern[1..], &segment[1..]),
        Some(c) => {
            !segment.is_empty() && segment[0] == *c && match_chars(&pattern[1..], &segment[1..])
        }
    }
}

/// Walks `root` and returns the relative paths of every regular file.
fn walk_files(root: &Path) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();

            // Metadata follows symlinks; a dangling link fails here.
            let metadata = match std::fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable entry: {e}");
                    continue;
                }
            };

            if metadata.is_dir() {
                stack.push(path);
            } else if metadata.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    files.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Files collected for one step, by pattern.
#[derive(Debug, Default)]
pub struct CollectedArtifacts {
    /// Relative paths copied into the artifact store.
    pub files: Vec<String>,
    /// Patterns that matched nothing (warned, not fatal).
    pub unmatched_patterns: Vec<String>,
}

/// Evaluates the artifact patterns inside `build_dir` and copies every
/// match into `dest`, preserving relative paths and file modes.
///
/// Per-file copy failures are logged and skipped; they never fail the
/// step.
pub fn collect(
    build_dir: &Path,
    patterns: &[String],
    dest: &Path,
) -> std::io::Result<CollectedArtifacts> {
    let mut collected = CollectedArtifacts::default();

    if patterns.is_empty() {
        return Ok(collected);
    }

    let usable: Vec<&String> = patterns
        .iter()
        .filter(|p| {
            if pattern_is_excluded(p) {
                debug!(pattern = %p, "artifact pattern escapes the build directory, ignored");
                false
            } else {
                true
            }
        })
        .collect();

    if usable.is_empty() {
        return Ok(collected);
    }

    let files = walk_files(build_dir)?;

    for pattern in usable {
        let matches: Vec<&String> = files
            .iter()
            .filter(|f| glob_match(pattern, f))
            .collect();

        if matches.is_empty() {
            warn!(pattern = %pattern, "artifact pattern matched no files");
            collected.unmatched_patterns.push(pattern.clone());
            continue;
        }

        for rel in matches {
            if collected.files.contains(rel) {
                continue;
            }

            let src = build_dir.join(rel);
            let dst = dest.join(rel);

            if let Some(parent) = dst.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(file = %rel, "failed to create artifact directory: {e}");
                    continue;
                }
            }

            match std::fs::copy(&src, &dst) {
                Ok(_) => collected.files.push(rel.clone()),
                Err(e) => warn!(file = %rel, "failed to copy artifact: {e}"),
            }
        }
    }

    collected.files.sort();
    Ok(collected)
}

/// Copies previously collected artifacts into a step's build directory,
/// replaying the given stores in order so later steps win on conflicts.
pub fn rehydrate(stores: &[PathBuf], build_dir: &Path) -> std::io::Result<usize> {
    let mut restored = 0usize;

    for store in stores {
        if !store.exists() {
            continue;
        }

        for rel in walk_files(store)? {
            let src = store.join(&rel);
            let dst = build_dir.join(&rel);

            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }

            std::fs::copy(&src, &dst)?;
            restored += 1;
        }
    }

    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excluded_patterns() {
        assert!(pattern_is_excluded("~/artifact-in-home"));
        assert!(pattern_is_excluded("/etc/passwd"));
        assert!(pattern_is_excluded("../outside"));
        assert!(pattern_is_excluded("dist/../../outside"));
        assert!(!pattern_is_excluded("dist/**"));
        assert!(!pattern_is_excluded("file-name"));
    }

    #[test]
    fn test_glob_match_literals() {
        assert!(glob_match("file-name", "file-name"));
        assert!(!glob_match("file-name", "other"));
        assert!(!glob_match("folder-name", "folder-name/a"));
    }

    #[test]
    fn test_glob_match_single_star() {
        assert!(glob_match("dist/*.js", "dist/app.js"));
        assert!(!glob_match("dist/*.js", "dist/sub/app.js"));
        assert!(glob_match("*.txt", "notes.txt"));
        assert!(glob_match("*", ".hidden"));
    }

    #[test]
    fn test_glob_match_question_mark() {
        assert!(glob_match("log?.txt", "log1.txt"));
        assert!(!glob_match("log?.txt", "log10.txt"));
    }

    #[test]
    fn test_glob_match_double_star() {
        assert!(glob_match("valid-folder/**", "valid-folder/a"));
        assert!(glob_match("valid-folder/**", "valid-folder/sub/c"));
        assert!(!glob_match("valid-folder/**", "other/a"));
        assert!(glob_match("**/*.rs", "src/main.rs"));
        assert!(glob_match("**/*.rs", "main.rs"));
    }

    #[test]
    fn test_collect_matches_spec_scenario() {
        let build = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        for file in [
            "valid-folder/a",
            "valid-folder/b",
            "valid-folder/sub/c",
            "file-name",
            "folder-name/a",
        ] {
            let path = build.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, file).unwrap();
        }

        let patterns = vec![
            "~/artifact-in-home".to_string(),
            "valid-folder/**".to_string(),
            "invalid-folder/**".to_string(),
            "folder-name".to_string(),
            "file-name".to_string(),
        ];

        let collected = collect(build.path(), &patterns, dest.path()).unwrap();

        assert_eq!(
            collected.files,
            vec![
                "file-name",
                "valid-folder/a",
                "valid-folder/b",
                "valid-folder/sub/c",
            ]
        );
        assert_eq!(
            collected.unmatched_patterns,
            vec!["invalid-folder/**", "folder-name"]
        );

        assert!(dest.path().join("valid-folder/sub/c").is_file());
        assert!(!dest.path().join("folder-name").exists());
    }

    #[test]
    fn test_collect_preserves_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let build = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        let script = build.path().join("run.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        collect(build.path(), &["run.sh".to_string()], dest.path()).unwrap();

        let mode = std::fs::metadata(dest.path().join("run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_rehydrate_round_trips() {
        let build = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let next_build = tempfile::tempdir().unwrap();

        let src = build.path().join("out/result.txt");
        std::fs::create_dir_all(src.parent().unwrap()).unwrap();
        std::fs::write(&src, "payload").unwrap();

        collect(build.path(), &["out/**".to_string()], store.path()).unwrap();
        let restored =
            rehydrate(&[store.path().to_path_buf()], next_build.path()).unwrap();

        assert_eq!(restored, 1);
        assert_eq!(
            std::fs::read_to_string(next_build.path().join("out/result.txt")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn test_rehydrate_later_store_wins() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let build = tempfile::tempdir().unwrap();

        std::fs::write(a.path().join("shared.txt"), "from-a").unwrap();
        std::fs::write(b.path().join("shared.txt"), "from-b").unwrap();

        rehydrate(
            &[a.path().to_path_buf(), b.path().to_path_buf()],
            build.path(),
        )
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(build.path().join("shared.txt")).unwrap(),
            "from-b"
        );
    }
}
