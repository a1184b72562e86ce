//! File identity as seen by the door.
//!
//! Resolving client file handles belongs to the namespace service; the door
//! only needs the file id and whether the file is a regular file served by a
//! pool or a special file served through the door itself.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Internal file identity (a pnfs id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub String);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle presented by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileHandle(pub Vec<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Regular,
    /// Pseudo files and anything else the door answers itself.
    Special,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub id: FileId,
    pub kind: FileKind,
    pub handle: FileHandle,
}

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("stale file handle")]
    Stale,
    #[error("namespace lookup failed: {0}")]
    Lookup(String),
}

#[async_trait]
pub trait Namespace: Send + Sync {
    async fn resolve(&self, handle: &FileHandle) -> Result<Inode, NamespaceError>;

    /// Drop any cached attributes of `inode`.
    fn invalidate(&self, inode: &Inode);
}

const KIND_REGULAR: u8 = 0;

/// Namespace for handles that carry their own identity: one kind byte
/// (zero for regular files) followed by the file id in ASCII.
#[derive(Debug, Default, Clone, Copy)]
pub struct HandleNamespace;

impl HandleNamespace {
    pub fn handle_for(id: &FileId, kind: FileKind) -> FileHandle {
        let tag = match kind {
            FileKind::Regular => KIND_REGULAR,
            FileKind::Special => 1,
        };
        let mut bytes = Vec::with_capacity(id.0.len() + 1);
        bytes.push(tag);
        bytes.extend_from_slice(id.0.as_bytes());
        FileHandle(bytes)
    }
}

#[async_trait]
impl Namespace for HandleNamespace {
    async fn resolve(&self, handle: &FileHandle) -> Result<Inode, NamespaceError> {
        let (tag, id) = handle.0.split_first().ok_or(NamespaceError::Stale)?;
        let id = std::str::from_utf8(id).map_err(|_| NamespaceError::Stale)?;
        if id.is_empty() {
            return Err(NamespaceError::Stale);
        }

        let kind = if *tag == KIND_REGULAR {
            FileKind::Regular
        } else {
            FileKind::Special
        };

        Ok(Inode {
            id: FileId(id.to_string()),
            kind,
            handle: handle.clone(),
        })
    }

    fn invalidate(&self, inode: &Inode) {
        // attributes are never cached here
        debug!(file = %inode.id, "Stat cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_namespace_resolves_kind_and_id() {
        let ns = HandleNamespace;
        let id = FileId("0000A1B2".into());

        let regular = ns
            .resolve(&HandleNamespace::handle_for(&id, FileKind::Regular))
            .await
            .unwrap();
        assert_eq!(regular.id, id);
        assert_eq!(regular.kind, FileKind::Regular);

        let special = ns
            .resolve(&HandleNamespace::handle_for(&id, FileKind::Special))
            .await
            .unwrap();
        assert_eq!(special.kind, FileKind::Special);
    }

    #[tokio::test]
    async fn empty_handle_is_stale() {
        let ns = HandleNamespace;
        assert!(matches!(
            ns.resolve(&FileHandle(vec![])).await,
            Err(NamespaceError::Stale)
        ));
        assert!(matches!(
            ns.resolve(&FileHandle(vec![0])).await,
            Err(NamespaceError::Stale)
        ));
    }
}
