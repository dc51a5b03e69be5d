//! Replica and replicator configuration.

use crate::name::ServiceName;
use std::path::{Path, PathBuf};

/// Configuration of the transactional replicator.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Whether to flush the replicator log on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Whether every collection registers an implicit `DataStore` child.
    ///
    /// With this on, registering one dictionary makes the state manager
    /// enumerate two providers: the dictionary and `<name>/dataStore`,
    /// which holds its entries.
    pub data_store_children: bool,

    /// Segment used to name the implicit child of a collection.
    pub data_store_segment: String,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            data_store_children: true,
            data_store_segment: "dataStore".to_string(),
        }
    }
}

impl ReplicatorConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to flush the log on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets whether collections register an implicit data store child.
    #[must_use]
    pub const fn data_store_children(mut self, value: bool) -> Self {
        self.data_store_children = value;
        self
    }

    /// Number of state manager entries one collection registration adds.
    #[must_use]
    pub const fn entries_per_collection(&self) -> usize {
        if self.data_store_children {
            2
        } else {
            1
        }
    }
}

/// Configuration of a replica.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Directory holding the replica's log, lock file and backup staging area.
    pub work_dir: PathBuf,

    /// Service the replica belongs to.
    pub service_name: ServiceName,

    /// Replicator settings.
    pub replicator: ReplicatorConfig,
}

impl ReplicaConfig {
    /// Creates a configuration with default replicator settings.
    #[must_use]
    pub fn new(work_dir: impl AsRef<Path>, service_name: ServiceName) -> Self {
        Self {
            work_dir: work_dir.as_ref().to_path_buf(),
            service_name,
            replicator: ReplicatorConfig::default(),
        }
    }

    /// Replaces the replicator settings.
    #[must_use]
    pub fn replicator(mut self, replicator: ReplicatorConfig) -> Self {
        self.replicator = replicator;
        self
    }
}
