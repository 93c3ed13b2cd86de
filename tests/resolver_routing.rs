//! spec.md §8.1 "Canonical routing": longest-prefix match is deterministic
//! and repeatable for a given resolver table and request.

mod common;

use acng_core::config::{RepoDescriptor, ResolverRoute};
use acng_core::resolver::RepoResolver;

fn build_resolver() -> RepoResolver {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = common::test_config(dir.path().to_path_buf());

    cfg.repos.insert(
        "debian".to_string(),
        RepoDescriptor {
            name: "debian".into(),
            backends: vec!["http://deb.debian.org/debian/".into()],
            keyfile_suffixes: vec!["Release.gpg".into()],
            proxy: None,
        },
    );
    cfg.repos.insert(
        "debian-security".to_string(),
        RepoDescriptor {
            name: "debian-security".into(),
            backends: vec!["http://security.debian.org/debian-security/".into()],
            keyfile_suffixes: vec![],
            proxy: None,
        },
    );

    cfg.resolver_table = vec![
        ResolverRoute { host_port: "mirror.local:3142".into(), path_prefix: "/debian".into(), repo: "debian".into() },
        ResolverRoute {
            host_port: "mirror.local:3142".into(),
            path_prefix: "/debian/security".into(),
            repo: "debian-security".into(),
        },
    ];
    RepoResolver::from_config(&cfg)
}

#[test]
fn longest_prefix_wins_over_shorter_overlapping_one() {
    let resolver = build_resolver();

    let hit = resolver.resolve("mirror.local:3142", "/debian/security/dists/stable/Release").unwrap();
    assert_eq!(hit.repo.name, "debian-security");
    assert_eq!(hit.rest_path, "dists/stable/Release");

    let other = resolver.resolve("mirror.local:3142", "/debian/pool/main/a.deb").unwrap();
    assert_eq!(other.repo.name, "debian");
    assert_eq!(other.rest_path, "pool/main/a.deb");
}

#[test]
fn repeated_resolution_is_deterministic() {
    let resolver = build_resolver();
    let a = resolver.resolve("mirror.local:3142", "/debian/security/dists/stable/Release").unwrap();
    let b = resolver.resolve("mirror.local:3142", "/debian/security/dists/stable/Release").unwrap();
    assert_eq!(a.repo.name, b.repo.name);
    assert_eq!(a.rest_path, b.rest_path);
}

#[test]
fn unknown_host_has_no_route() {
    let resolver = build_resolver();
    assert!(resolver.resolve("somewhere-else:80", "/debian/Release").is_none());
}
