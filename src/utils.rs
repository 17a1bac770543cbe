//! Small helpers shared across the runner: slugs, path digests, shell
//! escaping, and size formatting.

use std::path::Path;

use base64::Engine;
use sha2::{Digest, Sha256};

/// Turns an arbitrary string into a lowercase, dash-separated slug.
///
/// Consecutive non-alphanumeric characters collapse into a single dash;
/// leading and trailing dashes are stripped.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut last_was_dash = true;

    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }

    slug
}

/// Derives a stable, filesystem-safe slug for a project directory.
///
/// Two different directories with the same basename must not collide, so
/// the slug carries a short digest of the absolute path.
pub fn hashify_path(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());

    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let suffix = base64::engine::general_purpose::URL_SAFE.encode(digest);

    format!("{}-{}", slugify(&name), &suffix[..8])
}

/// Formats a byte count using binary units, e.g. `3.2MiB`.
pub fn human_readable_size(value: u64) -> String {
    let mut num = value as f64;

    for unit in ["B", "KiB", "MiB", "GiB"] {
        if num < 1024.0 {
            return format!("{num:.1}{unit}");
        }

        num /= 1024.0;
    }

    format!("{num:.1}TiB")
}

/// Escapes a command line so it can appear inside a double-quoted printf
/// format string without being re-interpreted by the shell.
///
/// Every troublesome character is replaced with its `\xNN` escape, which
/// printf turns back into the original byte.
pub fn escape_shell_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '\\' | '$' | '%' | '{' | '}' | '"' | '\'' => {
                escaped.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ => escaped.push(c),
        }
    }

    escaped
}

/// Creates a directory (and parents) if missing and returns its path.
pub fn ensure_directory(path: &Path) -> std::io::Result<&Path> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("My Step Name"), "my-step-name");
        assert_eq!(slugify("build & test!"), "build-test");
        assert_eq!(slugify("--already--dashed--"), "already-dashed");
    }

    #[test]
    fn test_slugify_empty() {
        assert_eq!(slugify(""), "");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn test_hashify_path_is_stable() {
        let a = hashify_path(&PathBuf::from("/home/user/my-project"));
        let b = hashify_path(&PathBuf::from("/home/user/my-project"));
        assert_eq!(a, b);
        assert!(a.starts_with("my-project-"));
    }

    #[test]
    fn test_hashify_path_distinguishes_directories() {
        let a = hashify_path(&PathBuf::from("/home/alice/app"));
        let b = hashify_path(&PathBuf::from("/home/bob/app"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_human_readable_size() {
        assert_eq!(human_readable_size(512), "512.0B");
        assert_eq!(human_readable_size(2048), "2.0KiB");
        assert_eq!(human_readable_size(5 * 1024 * 1024), "5.0MiB");
    }

    #[test]
    fn test_escape_shell_string() {
        assert_eq!(escape_shell_string("echo $HOME"), "echo \\x24HOME");
        assert_eq!(escape_shell_string(r#"say "hi""#), "say \\x22hi\\x22");
        assert_eq!(escape_shell_string("plain"), "plain");
    }
}
