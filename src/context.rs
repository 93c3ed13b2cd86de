//! Shared application context (spec.md §9 design note): the source wires
//! its components together through process-global singletons
//! (`g_registry`, `g_tcp_con_factory`, `g_victor`). Idiomatic Rust has no
//! equivalent of a silent global constructor order, so those singletons
//! become fields of one `Context` value built once in `main` and handed
//! to every connection handler and background task by `Arc` clone.

use std::sync::Arc;

use tracing::warn;

use crate::agent::engine::DownloadAgent;
use crate::cache::registry::Registry;
use crate::cache::store::CacheStore;
use crate::clientjob::classify::{AlwaysSolid, UrlClassifier};
use crate::config::AcngConfig;
use crate::connector::{Connector, TcpConnector};
use crate::resolver::RepoResolver;

/// Everything a [`crate::clientjob::ClientJob`] or background task needs to
/// do its work, minus anything connection-specific.
pub struct Context {
    pub config: Arc<AcngConfig>,
    pub store: Arc<CacheStore>,
    pub registry: Arc<Registry>,
    pub resolver: RepoResolver,
    pub agent: Arc<DownloadAgent>,
    pub classifier: Arc<dyn UrlClassifier>,
    /// `host:port` this instance is reachable as, used to recognize
    /// requests addressed to it by absolute-URL clients (spec.md §4.6.1
    /// step 9).
    pub own_host_port: String,
}

impl Context {
    /// Builds a `Context` from a loaded configuration, wiring the store,
    /// registry, resolver and download agent the way `main` would (spec.md
    /// §9). Uses the built-in [`TcpConnector`] and an [`AlwaysSolid`]
    /// classifier; callers with a real pattern table or a mock connector
    /// for tests should build the fields directly instead.
    pub fn new(config: AcngConfig, own_host_port: String) -> Arc<Self> {
        let config = Arc::new(config);
        let store = Arc::new(CacheStore::with_allocspace(
            config.cachedir.clone(),
            config.dirperms,
            config.fileperms,
            config.stupidfs,
            config.allocspace,
        ));
        let registry = Registry::new(store.clone(), config.clone());
        let resolver = RepoResolver::from_config(&config);
        let connector: Arc<dyn Connector> = Arc::new(TcpConnector::new(config.fasttimeout));
        let agent = DownloadAgent::new(config.clone(), connector);
        let classifier: Arc<dyn UrlClassifier> = Arc::new(AlwaysSolid);

        Arc::new(Self { config, store, registry, resolver, agent, classifier, own_host_port })
    }

    /// Hands a freshly acquired file-item holder off to the download agent
    /// as a detached task (spec.md §4.6.1 step 10: acquiring a file-item
    /// that isn't `Complete` schedules a fetch without blocking the client
    /// job that triggered it — concurrent requests for the same key just
    /// observe the same in-flight item via the registry).
    pub fn spawn_download(
        self: &Arc<Self>,
        holder: crate::cache::holder::FileItemHolder,
        target: crate::agent::job::JobTarget,
        is_passthrough: bool,
    ) {
        let agent = self.agent.clone();
        let redir_budget = self.config.redirmax;
        tokio::spawn(async move {
            let mut job =
                crate::agent::job::DownloadJob::new(holder, target, Vec::new(), is_passthrough, redir_budget);
            if let Err(err) = agent.run_job(&mut job).await {
                warn!(error = %err, "download job failed");
            }
        });
    }
}
