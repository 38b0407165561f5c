use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

pub use davmirror_core::ResourceProperties;

/// A configured remote endpoint. The identifier is opaque and stable; it may
/// never contain the `::` separator reserved by session identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub base_url: Url,
    pub username: String,
    pub label: Option<String>,
}

/// Primary key of the store and dispatch key of the transfer layer: an
/// account identifier plus a path of non-empty components. The empty path is
/// the account root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceID {
    pub account: String,
    pub path: Vec<String>,
}

impl ResourceID {
    pub fn new(account: impl Into<String>, path: Vec<String>) -> Self {
        Self {
            account: account.into(),
            path,
        }
    }

    pub fn root(account: impl Into<String>) -> Self {
        Self::new(account, Vec::new())
    }
}

impl fmt::Display for ResourceID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.account, join_path(&self.path))
    }
}

/// Whether a cached body exists for a resource, and for which version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    Absent,
    Downloading,
    Present {
        local_path: PathBuf,
        stored_version: String,
    },
}

impl FileState {
    pub fn is_present_at(&self, version: &str) -> bool {
        matches!(self, FileState::Present { stored_version, .. } if stored_version == version)
    }
}

/// One node of an account's mirror tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceID,
    pub is_collection: bool,
    /// Opaque remote version token (etag); empty when unknown.
    pub version: String,
    /// Set when the subtree has not been reconciled since the last mutation
    /// beneath this node.
    pub dirty: bool,
    /// Unix timestamp of the last successful property write.
    pub updated: i64,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub modified: Option<i64>,
    pub file_state: FileState,
}

impl Resource {
    pub fn path(&self) -> &[String] {
        &self.id.path
    }

    /// True when a body download is required to bring the cache in line with
    /// the recorded version.
    pub fn needs_body(&self) -> bool {
        !self.is_collection && !self.file_state.is_present_at(&self.version)
    }
}

/// The observable result of a property-tree mutation: the two disjoint sets
/// of nodes that were written and removed, auto-materialized ancestors
/// included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub inserted_or_updated: Vec<Resource>,
    pub deleted: Vec<Resource>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted_or_updated.is_empty() && self.deleted.is_empty()
    }
}

/// Accumulates per-row effects during one store transaction while keeping
/// the two sets disjoint: a path written after being deleted (or the other
/// way round) only ever lands in the set recording its final state.
#[derive(Debug, Default)]
pub(crate) struct ChangeSetBuilder {
    inserted_or_updated: BTreeMap<Vec<String>, Resource>,
    deleted: BTreeMap<Vec<String>, Resource>,
}

impl ChangeSetBuilder {
    pub(crate) fn record_upserted(&mut self, resource: Resource) {
        self.deleted.remove(resource.path());
        self.inserted_or_updated
            .insert(resource.path().to_vec(), resource);
    }

    pub(crate) fn record_deleted(&mut self, resource: Resource) {
        self.inserted_or_updated.remove(resource.path());
        self.deleted.insert(resource.path().to_vec(), resource);
    }

    pub(crate) fn finish(self) -> ChangeSet {
        ChangeSet {
            inserted_or_updated: self.inserted_or_updated.into_values().collect(),
            deleted: self.deleted.into_values().collect(),
        }
    }
}

/// Joins path components into the store's key encoding. The account root is
/// the empty string.
pub fn join_path(components: &[String]) -> String {
    components.join("/")
}

/// Splits a stored key back into components.
pub fn split_path(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split('/').map(str::to_string).collect()
}
