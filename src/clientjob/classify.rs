//! URL classification (spec.md §4.6.1 step 6) and nasty-path rejection
//! (step 4).
//!
//! SPEC_FULL.md §1 keeps "regex/MIME tables content" out of scope: the
//! *content* of the operator's solid/volatile/whitelist pattern tables is
//! a deployment detail, not core-engine logic. What the engine owns is the
//! mechanical, non-configurable traversal check, plus the seam
//! ([`UrlClassifier`]) an operator wires a real pattern table into —
//! mirroring how `Connector` stands in for the TLS/DNS layer this crate
//! also excludes.

/// Mirrors the source's `eMatchType` (spec.md §4.6.1 step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    Solid,
    Volatile,
    Whitelist,
    Nasty,
    PassThrough,
    Special,
}

/// Operator-supplied URL classifier. The real pattern tables (file
/// extension/regex sets, per-repo overrides) live outside this crate;
/// `Context` is constructed with one.
pub trait UrlClassifier: Send + Sync {
    fn classify(&self, path: &str) -> FileClass;
}

/// Treats everything as solid/cacheable. Useful for tests and for a
/// minimal standalone deployment with no pattern table configured.
#[derive(Debug, Default)]
pub struct AlwaysSolid;

impl UrlClassifier for AlwaysSolid {
    fn classify(&self, _path: &str) -> FileClass {
        FileClass::Solid
    }
}

/// Rejects `..` traversal and null bytes. Grounded on
/// `original_source/src/acfg.cc`'s path-safety checks (internal-prefix
/// rejection is delegated to the injected [`UrlClassifier`], since that
/// prefix list is deployment-specific configuration).
pub fn is_nasty_path(path: &str) -> bool {
    if path.contains('\0') {
        return true;
    }
    path.split('/').any(|seg| seg == "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_segments_are_nasty() {
        assert!(is_nasty_path("/debian/../../etc/passwd"));
        assert!(is_nasty_path("/../secrets"));
    }

    #[test]
    fn ordinary_paths_are_not_nasty() {
        assert!(!is_nasty_path("/debian/pool/main/a.deb"));
        assert!(!is_nasty_path("/debian/dot.dot..deb"));
    }

    #[test]
    fn null_byte_is_nasty() {
        assert!(is_nasty_path("/debian/a\0.deb"));
    }
}
