//! Configuration surface consumed by the core (spec.md §6.4).
//!
//! Loaded from TOML via the `config` crate, following the teacher's
//! `Config::from_file` pattern. Held as an immutable `Arc<AcngConfig>`: the
//! core engine never mutates configuration at runtime (reload is a matter of
//! swapping the `Arc`, which belongs to the excluded CLI/maintenance layer).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{AcngError, Result};

/// `vrangeops` tri-state (spec.md §6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RangeOpsMode {
    Disabled,
    #[default]
    Enabled,
    ProbeOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoDescriptor {
    pub name: String,
    pub backends: Vec<String>,
    #[serde(default)]
    pub keyfile_suffixes: Vec<String>,
    #[serde(default)]
    pub proxy: Option<String>,
}

/// One row of the `(host:port, path_prefix) -> repo` resolver table
/// (spec.md §3.4, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverRoute {
    pub host_port: String,
    pub path_prefix: String,
    pub repo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcngConfig {
    pub cachedir: PathBuf,

    #[serde(with = "humantime_serde", default = "default_nettimeout")]
    pub nettimeout: Duration,
    #[serde(with = "humantime_serde", default = "default_fasttimeout")]
    pub fasttimeout: Duration,
    #[serde(with = "humantime_serde", default = "default_maxtempdelay")]
    pub maxtempdelay: Duration,
    #[serde(with = "humantime_serde", default = "default_stucksecs")]
    pub stucksecs: Duration,

    #[serde(default = "default_pipelinelen")]
    pub pipelinelen: usize,
    #[serde(default = "default_true")]
    pub persistoutgoing: bool,
    #[serde(default = "default_redirmax")]
    pub redirmax: u32,
    #[serde(default = "default_dlretriesmax")]
    pub dlretriesmax: u32,
    /// KiB/s; `0` is the documented "disabled" sentinel.
    #[serde(default)]
    pub maxdlspeed: u64,
    #[serde(default = "default_allocspace")]
    pub allocspace: u64,
    #[serde(default = "default_dlbufsize")]
    pub dlbufsize: usize,
    #[serde(default)]
    pub vrangeops: RangeOpsMode,
    #[serde(default)]
    pub exporigin: bool,
    #[serde(default)]
    pub offlinemode: bool,
    #[serde(default = "default_dirperms")]
    pub dirperms: u32,
    #[serde(default = "default_fileperms")]
    pub fileperms: u32,
    #[serde(default)]
    pub stupidfs: bool,
    #[serde(default)]
    pub trackfileuse: bool,

    #[serde(default)]
    pub resolver_table: Vec<ResolverRoute>,
    #[serde(default)]
    pub repos: HashMap<String, RepoDescriptor>,

    #[serde(default)]
    pub global_proxy: Option<String>,
    #[serde(default)]
    pub extra_upstream_headers: Vec<(String, String)>,
    #[serde(default)]
    pub forward_client_xff: bool,

    #[serde(default = "default_prolonged_lifetime")]
    #[serde(with = "humantime_serde")]
    pub prolonged_item_lifetime: Duration,

    #[serde(default)]
    pub escape_dos_unfriendly: bool,
}

fn default_true() -> bool {
    true
}
fn default_nettimeout() -> Duration {
    Duration::from_secs(30)
}
fn default_fasttimeout() -> Duration {
    Duration::from_millis(500)
}
fn default_maxtempdelay() -> Duration {
    Duration::from_secs(27)
}
fn default_stucksecs() -> Duration {
    Duration::from_secs(200)
}
fn default_pipelinelen() -> usize {
    10
}
fn default_redirmax() -> u32 {
    20
}
fn default_dlretriesmax() -> u32 {
    15
}
fn default_allocspace() -> u64 {
    8 * 1024 * 1024
}
fn default_dlbufsize() -> usize {
    32 * 1024
}
fn default_dirperms() -> u32 {
    0o755
}
fn default_fileperms() -> u32 {
    0o644
}
fn default_prolonged_lifetime() -> Duration {
    Duration::from_secs(20)
}

impl AcngConfig {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(|e| AcngError::Config(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| AcngError::Config(e.to_string()))
    }

    #[cfg(test)]
    pub fn for_tests(cachedir: PathBuf) -> Self {
        Self {
            cachedir,
            nettimeout: default_nettimeout(),
            fasttimeout: default_fasttimeout(),
            maxtempdelay: default_maxtempdelay(),
            stucksecs: default_stucksecs(),
            pipelinelen: default_pipelinelen(),
            persistoutgoing: true,
            redirmax: default_redirmax(),
            dlretriesmax: default_dlretriesmax(),
            maxdlspeed: 0,
            allocspace: default_allocspace(),
            dlbufsize: default_dlbufsize(),
            vrangeops: RangeOpsMode::Enabled,
            exporigin: true,
            offlinemode: false,
            dirperms: default_dirperms(),
            fileperms: default_fileperms(),
            stupidfs: false,
            trackfileuse: false,
            resolver_table: Vec::new(),
            repos: HashMap::new(),
            global_proxy: None,
            extra_upstream_headers: Vec::new(),
            forward_client_xff: false,
            prolonged_item_lifetime: default_prolonged_lifetime(),
            escape_dos_unfriendly: false,
        }
    }
}
