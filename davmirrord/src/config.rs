use std::path::PathBuf;

/// Construction-time options for the engine. Nothing here is read from the
/// environment; the host passes everything explicitly.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root directory for all persisted state: the account registry plus one
    /// subdirectory per account (property database, body cache, staging).
    pub directory: PathBuf,
    /// Namespace for background transfer session identifiers.
    pub bundle_identifier: String,
    /// Passed through to the transfer session on platforms that share
    /// containers between processes; inert here.
    pub shared_container_identifier: Option<String>,
}

impl ServiceConfig {
    pub fn new(directory: impl Into<PathBuf>, bundle_identifier: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            bundle_identifier: bundle_identifier.into(),
            shared_container_identifier: None,
        }
    }

    pub fn with_shared_container(mut self, identifier: impl Into<String>) -> Self {
        self.shared_container_identifier = Some(identifier.into());
        self
    }
}
