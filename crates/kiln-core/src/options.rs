//! Build and cache-prune options.
//!
//! These values are decoded from the request by the API layer and passed
//! through to the backend untouched.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Which builder implementation the client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BuilderVersion {
    /// Classic builder (`version=1`).
    #[default]
    V1,
    /// BuildKit (`version=2`).
    BuildKit,
}

impl BuilderVersion {
    pub fn from_param(value: &str) -> Option<Self> {
        match value {
            "" | "1" => Some(BuilderVersion::V1),
            "2" => Some(BuilderVersion::BuildKit),
            _ => None,
        }
    }
}

impl fmt::Display for BuilderVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuilderVersion::V1 => write!(f, "1"),
            BuilderVersion::BuildKit => write!(f, "2"),
        }
    }
}

/// An exporter requested through the `outputs` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildOutput {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Attrs", default)]
    pub attrs: HashMap<String, String>,
}

/// Options for a single image build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOptions {
    pub tags: Vec<String>,
    pub dockerfile: String,
    pub remote_context: Option<String>,
    /// Build arguments; `None` means "take the value from the environment".
    pub build_args: BTreeMap<String, Option<String>>,
    pub labels: BTreeMap<String, String>,
    pub no_cache: bool,
    pub remove: bool,
    pub force_remove: bool,
    pub pull: bool,
    pub suppress_output: bool,
    pub target: Option<String>,
    pub platform: Option<String>,
    pub network_mode: Option<String>,
    pub cache_from: Vec<String>,
    pub shm_size: Option<u64>,
    pub memory: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub build_id: Option<String>,
    pub builder_version: BuilderVersion,
    pub outputs: Vec<BuildOutput>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            dockerfile: "Dockerfile".to_string(),
            remote_context: None,
            build_args: BTreeMap::new(),
            labels: BTreeMap::new(),
            no_cache: false,
            remove: true,
            force_remove: false,
            pull: false,
            suppress_output: false,
            target: None,
            platform: None,
            network_mode: None,
            cache_from: Vec::new(),
            shm_size: None,
            memory: None,
            cpu_shares: None,
            build_id: None,
            builder_version: BuilderVersion::default(),
            outputs: Vec::new(),
        }
    }
}

/// Options for pruning the build cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePruneOptions {
    /// Remove every record, not just unused ones.
    pub all: bool,
    /// Keep at most this many bytes of cache (0 = no limit applied).
    pub keep_storage: u64,
    pub filters: HashMap<String, Vec<String>>,
}

/// Outcome of a cache prune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePruneReport {
    #[serde(rename = "CachesDeleted")]
    pub caches_deleted: Vec<String>,
    #[serde(rename = "SpaceReclaimed")]
    pub space_reclaimed: u64,
}
