//! Remote path arithmetic.
//!
//! Remote paths are always `/`-separated strings, independent of the local
//! platform. A path starting with `/` is absolute; anything else is resolved
//! by the server against the login directory.

pub const SEPARATOR: char = '/';

pub fn is_absolute(path: &str) -> bool {
    path.starts_with(SEPARATOR)
}

/// Collapse repeated separators and `.` segments, and drop a trailing
/// separator (except for the root).
pub fn normalize(path: &str) -> String {
    let absolute = is_absolute(path);
    let joined = path
        .split(SEPARATOR)
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/");

    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Parent directory, `None` for the root and for a bare relative name.
pub fn parent(path: &str) -> Option<String> {
    let path = normalize(path);
    if path == "/" || path == "." {
        return None;
    }
    match path.rfind(SEPARATOR) {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// Last path segment.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEPARATOR);
    match trimmed.rfind(SEPARATOR) {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

pub fn join(base: &str, name: &str) -> String {
    let name = name.trim_start_matches(SEPARATOR);
    if base.is_empty() || base == "." {
        name.to_string()
    } else if base.ends_with(SEPARATOR) {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Every prefix of `path`, root-most first, ending with `path` itself.
///
/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`; `a/b` yields `a`, `a/b`. The root
/// itself is never included.
pub fn ancestors(path: &str) -> Vec<String> {
    let absolute = is_absolute(path);
    let mut current = String::new();
    let mut out = Vec::new();

    for segment in path.split(SEPARATOR).filter(|s| !s.is_empty()) {
        if absolute || !current.is_empty() {
            current.push(SEPARATOR);
        }
        current.push_str(segment);
        out.push(current.clone());
    }

    out
}

/// Resolve a move target: absolute targets stand, relative ones sit beside `source`.
pub fn resolve_sibling(source: &str, target: &str) -> String {
    if is_absolute(target) {
        return normalize(target);
    }
    match parent(source) {
        Some(dir) => normalize(&join(&dir, target)),
        None => normalize(target),
    }
}

/// `path` relative to `root`, or `None` when `path` is not under `root`.
///
/// A root of `.` is the login directory: every relative path sits under it.
pub fn strip_root<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    let root = root.trim_end_matches(SEPARATOR);
    if root.is_empty() {
        return Some(path.trim_start_matches(SEPARATOR));
    }
    if root == "." {
        if is_absolute(path) {
            return None;
        }
        let rest = path.strip_prefix("./").unwrap_or(path);
        return Some(if rest == "." { "" } else { rest });
    }
    let rest = path.strip_prefix(root)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix(SEPARATOR)
    }
}
