//! Path canonicalization and name validation for repo trees.
//!
//! All tree paths use `/` separators. Canonicalization is purely lexical:
//! backslashes are folded to slashes, `.`/`..`/empty segments are
//! resolved, and the result never ends with a slash (except the root).

/// Canonicalize a repo path: `\` → `/`, collapse duplicate separators,
/// resolve `.` and `..` lexically.
pub fn canon_path(p: &str) -> String {
    let replaced = p.replace('\\', "/");
    let absolute = replaced.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in replaced.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    if absolute {
        format!("/{}", parts.join("/"))
    } else {
        parts.join("/")
    }
}

/// Join path segments with a single separator, canonicalizing the result.
pub fn join_paths(base: &str, rest: &str) -> String {
    canon_path(&format!("{base}/{rest}"))
}

/// Split `/a/b/c` into (`/a/b`, `c`). The root splits into (`/`, ``).
pub fn split_parent(path: &str) -> (String, String) {
    let canon = canon_path(path);
    match canon.rfind('/') {
        Some(0) => ("/".to_string(), canon[1..].to_string()),
        Some(idx) => (canon[..idx].to_string(), canon[idx + 1..].to_string()),
        None => ("/".to_string(), canon),
    }
}

/// The final segment of a path.
pub fn base_name(path: &str) -> String {
    split_parent(path).1
}

/// Whether a file name is acceptable in a directory entry.
///
/// Names must be valid UTF-8 (guaranteed by `&str`), shorter than 256
/// bytes, and must not contain a path separator.
pub fn is_valid_filename(name: &str) -> bool {
    !name.is_empty() && name.len() < 256 && !name.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canon_collapses_separators() {
        assert_eq!(canon_path("/a//b/"), "/a/b");
        assert_eq!(canon_path("\\a\\b"), "/a/b");
        assert_eq!(canon_path("/"), "/");
        assert_eq!(canon_path("a/./b/../c"), "a/c");
    }

    #[test]
    fn join_and_split() {
        assert_eq!(join_paths("/", "docs/img"), "/docs/img");
        assert_eq!(join_paths("/docs", "img"), "/docs/img");
        assert_eq!(split_parent("/docs/img"), ("/docs".into(), "img".into()));
        assert_eq!(split_parent("/docs"), ("/".into(), "docs".into()));
        assert_eq!(base_name("/a/b/c.txt"), "c.txt");
    }

    #[test]
    fn filename_rules() {
        assert!(is_valid_filename("a.txt"));
        assert!(!is_valid_filename(""));
        assert!(!is_valid_filename("a/b"));
        assert!(!is_valid_filename(&"x".repeat(256)));
        assert!(is_valid_filename(&"x".repeat(255)));
    }
}
