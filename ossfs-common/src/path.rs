//! Path resolution: user-supplied paths and URLs to `(container, key)`.
//!
//! Accepted forms, all normalizing to `/container/key`:
//! - bare paths: `/container/key`, `container/key`
//! - scheme-prefixed: `oss://container/key`
//! - endpoint URLs: `https://oss-cn-hangzhou.aliyuncs.com/container/key`
//!
//! Leading slashes collapse to one and trailing slashes are trimmed. Empty
//! segments inside a key (`a//b`) are kept: object keys may contain them.

use serde::Serialize;

/// The root marker: the set of all containers.
pub const ROOT: &str = "/";
/// Separator used for delimiter-based listing.
pub const DELIMITER: &str = "/";

/// A path split into the container and the key inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResolvedLocation {
    pub container: String,
    /// Empty when the location addresses the container itself.
    pub key: String,
}

impl ResolvedLocation {
    pub fn is_root(&self) -> bool {
        self.container.is_empty()
    }

    pub fn is_container(&self) -> bool {
        !self.container.is_empty() && self.key.is_empty()
    }

    /// Listing prefix for the children of this location.
    pub fn dir_prefix(&self) -> String {
        if self.key.is_empty() {
            String::new()
        } else {
            format!("{}{}", self.key, DELIMITER)
        }
    }

    /// Normalized path of this location.
    pub fn to_path(&self) -> String {
        join(&self.container, &self.key)
    }
}

fn is_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Remove a scheme or endpoint prefix, leaving the `container/key` part.
pub fn strip_protocol(path: &str) -> &str {
    let Some((scheme, rest)) = path.split_once("://") else {
        return path;
    };
    if !is_scheme(scheme) {
        return path;
    }
    if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") {
        // The host is the endpoint; the URL path carries container and key.
        return match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "",
        };
    }
    rest
}

/// Normalize any accepted path form to `/container/key`, or [`ROOT`].
pub fn normalize(path: &str) -> String {
    let stripped = strip_protocol(path)
        .trim_start_matches('/')
        .trim_end_matches('/');
    if stripped.is_empty() {
        ROOT.to_string()
    } else {
        format!("/{}", stripped)
    }
}

/// Split a path into `(container, key)`. A path with no key addresses the
/// container; the root yields two empty strings.
pub fn split(path: &str) -> (String, String) {
    let normalized = normalize(path);
    let inner = &normalized[1..];
    match inner.split_once('/') {
        Some((container, key)) => (container.to_string(), key.to_string()),
        None => (inner.to_string(), String::new()),
    }
}

pub fn resolve(path: &str) -> ResolvedLocation {
    let (container, key) = split(path);
    ResolvedLocation { container, key }
}

/// Build the normalized path for a container and key.
pub fn join(container: &str, key: &str) -> String {
    match (container.is_empty(), key.is_empty()) {
        (true, _) => ROOT.to_string(),
        (false, true) => format!("/{}", container),
        (false, false) => format!("/{}/{}", container, key),
    }
}

pub fn is_root(path: &str) -> bool {
    normalize(path) == ROOT
}

/// Parent directory of a path; the root is its own parent.
pub fn parent(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        Some(0) | None => ROOT.to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}

/// All proper ancestors of a path, nearest first, ending with the root.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = normalize(path);
    while current != ROOT {
        current = parent(&current);
        out.push(current.clone());
    }
    out
}

/// Final component of a path.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Whether `path` equals `dir` or lies underneath it.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir == ROOT {
        return true;
    }
    path == dir
        || (path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/')
}

/// Number of path components below `root` (a direct child has depth 1).
pub fn depth_below(path: &str, root: &str) -> usize {
    let rest = if root == ROOT {
        path.trim_start_matches('/')
    } else {
        path.strip_prefix(root).unwrap_or(path).trim_start_matches('/')
    };
    if rest.is_empty() {
        0
    } else {
        rest.split('/').count()
    }
}
