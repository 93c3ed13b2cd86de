//! Repo Resolver (spec.md §4.7): maps `(host:port, url_path)` to a
//! `(repo_descriptor, rest_path)` pair by longest-prefix match, or signals
//! that the request should be treated as an explicit target.
//!
//! Grounded on `original_source/src/remotedb.cc` (table lookup by host,
//! longest matching path prefix wins).

use crate::config::{AcngConfig, RepoDescriptor};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub repo: Arc<RepoDescriptor>,
    pub rest_path: String,
}

/// Read-only table built once from configuration (spec.md §4.7: "Read-only
/// table populated from config").
#[derive(Debug)]
pub struct RepoResolver {
    // host:port -> list of (path_prefix, repo), longest prefix matched first
    by_host: HashMap<String, Vec<(String, Arc<RepoDescriptor>)>>,
}

impl RepoResolver {
    pub fn from_config(cfg: &AcngConfig) -> Self {
        let mut by_host: HashMap<String, Vec<(String, Arc<RepoDescriptor>)>> = HashMap::new();
        for route in &cfg.resolver_table {
            let Some(repo) = cfg.repos.get(&route.repo) else {
                continue;
            };
            by_host
                .entry(route.host_port.clone())
                .or_default()
                .push((route.path_prefix.clone(), Arc::new(repo.clone())));
        }
        // Longest prefix first so the first match in `resolve` is the best one.
        for entries in by_host.values_mut() {
            entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        }
        Self { by_host }
    }

    /// Resolves `host:port` + `url_path` to a repo + remaining path.
    /// Deterministic: repeated calls with the same inputs return the same
    /// result (spec.md §8.1 "Canonical routing").
    pub fn resolve(&self, host_port: &str, url_path: &str) -> Option<ResolvedRoute> {
        let entries = self.by_host.get(host_port)?;
        entries
            .iter()
            .find(|(prefix, _)| url_path.starts_with(prefix.as_str()))
            .map(|(prefix, repo)| ResolvedRoute {
                repo: repo.clone(),
                rest_path: url_path[prefix.len()..].trim_start_matches('/').to_string(),
            })
    }
}
