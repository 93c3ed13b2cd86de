//! Canonical Cache Key derivation (spec.md §3.1) and path normalization.
//!
//! The key is both the registry lookup key and the on-disk relative path, so
//! normalization must be idempotent (spec.md §8.1: `normalize(normalize(x))
//! == normalize(x)`) and must never escape the cache root.

use crate::resolver::{RepoResolver, ResolvedRoute};

/// DOS-hostile characters the operator may opt to escape (spec.md §3.1),
/// grounded on `original_source/src/fileio.h`'s `ENEMIESOFDOSFS`.
const DOS_UNFRIENDLY: &str = "?[]\\=+<>:;#";

#[derive(Debug, Clone)]
pub struct CacheKey {
    pub path: String,
    pub repo_name: Option<String>,
}

/// Collapses `.`/`..`/empty segments and leading slashes. Never produces a
/// path that escapes its own root: a leading `..` segment is simply dropped.
pub fn normalize_path(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    out.join("/")
}

fn escape_dos_unfriendly(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if DOS_UNFRIENDLY.contains(c) {
            out.push_str(&format!("%{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

/// Derives the canonical key for a request, per spec.md §3.1.
pub fn derive_key(
    resolver: &RepoResolver,
    host_port: &str,
    url_path: &str,
    escape_dos: bool,
) -> CacheKey {
    let normalized_path = normalize_path(url_path);

    let (path, repo_name) = match resolver.resolve(host_port, &format!("/{normalized_path}")) {
        Some(ResolvedRoute { repo, rest_path }) => {
            (format!("{}/{}", repo.name, rest_path), Some(repo.name.clone()))
        }
        None => (format!("{host_port}/{normalized_path}"), None),
    };

    let path = if escape_dos {
        escape_dos_unfriendly(&path)
    } else {
        path
    };

    CacheKey { path, repo_name }
}
