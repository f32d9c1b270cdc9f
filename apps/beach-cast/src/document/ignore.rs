use std::collections::HashMap;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::host::{Resource, Workspace};

/// Resources larger than this (0.8 MiB) are announced but never streamed.
pub const MAX_DOCUMENT_BYTES: usize = 838_860;

const FILE_ID_HEX_LEN: usize = 16;

/// Stable identifier for a resource, derived from its display path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileId(String);

impl FileId {
    pub fn for_path(path: &str) -> Self {
        let digest = Sha256::digest(path.as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(FILE_ID_HEX_LEN);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remembers, per resource uri, whether the resource must stay hidden from viewers.
///
/// The host is asked at most once per uri for the lifetime of the cache.
#[derive(Debug, Default)]
pub struct IgnoreCache {
    hidden: HashMap<String, bool>,
}

impl IgnoreCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_hidden(&mut self, resource: &Resource, workspace: &dyn Workspace) -> bool {
        if let Some(hidden) = self.hidden.get(&resource.uri) {
            return *hidden;
        }
        let status = workspace.resolve_ignore_status(resource).await;
        tracing::debug!(
            target: "beach_cast::document",
            path = %resource.path,
            ignored = status.ignored,
            too_large = status.too_large,
            "resolved ignore status"
        );
        self.hidden.insert(resource.uri.clone(), status.is_hidden());
        status.is_hidden()
    }

    /// Records a resource found to exceed [`MAX_DOCUMENT_BYTES`] after its text was fetched.
    pub fn mark_too_large(&mut self, uri: &str) {
        self.hidden.insert(uri.to_owned(), true);
    }

    pub fn cached(&self, uri: &str) -> Option<bool> {
        self.hidden.get(uri).copied()
    }
}
