//! Server-side resource enumeration.
//!
//! The catalog is a snapshot of the plain files directly under the resource
//! directory. It is rebuilt on every `LIST`; two queries may legitimately
//! disagree. Names that cannot be represented on the wire (embedded `|`, CR,
//! or LF) are skipped with a warning rather than corrupting the framing.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// One transferable resource: file name and size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub name: String,
    pub size_bytes: u64,
}

/// Enumerates transferable resources under a fixed root directory.
#[derive(Debug, Clone)]
pub struct ResourceCatalog {
    root: PathBuf,
}

/// Bytes that would break the delimited wire encoding of names.
fn name_is_wire_safe(name: &str) -> bool {
    !name.is_empty() && !name.contains(['|', '\r', '\n'])
}

impl ResourceCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan the resource root. An inaccessible root yields an empty catalog
    /// plus a logged error — never a dispatcher crash.
    pub async fn scan(&self) -> Vec<ResourceDescriptor> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), "Resource root inaccessible: {e}");
                return Vec::new();
            }
        };

        let mut resources = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let Ok(metadata) = entry.metadata().await else {
                        continue;
                    };
                    if !metadata.is_file() {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !name_is_wire_safe(&name) {
                        warn!(name, "Skipping resource with unencodable name");
                        continue;
                    }
                    resources.push(ResourceDescriptor {
                        name,
                        size_bytes: metadata.len(),
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(root = %self.root.display(), "Directory scan error: {e}");
                    break;
                }
            }
        }

        resources.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = resources.len(), "Catalog scan complete");
        resources
    }

    /// Resolve a client-supplied name to a path under the resource root.
    ///
    /// Names carrying path separators or `..` are refused — clients address
    /// resources by catalog name only, never by path.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return None;
        }
        Some(self.root.join(name))
    }

    /// Size of the named resource, or `None` if absent or unresolvable.
    pub async fn size_of(&self, name: &str) -> Option<u64> {
        let path = self.resolve(name)?;
        let metadata = tokio::fs::metadata(&path).await.ok()?;
        metadata.is_file().then_some(metadata.len())
    }
}
