//! Object store seam. Names are `/`-separated paths chosen deterministically by the
//! writers (raw batches, aggregates, dead letters), which is what makes retried writes
//! idempotent: putting an existing name with identical content is a no-op.

#[cfg(test)]
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PutOutcome {
    Created,
    /// Identical content already present; nothing was written.
    Unchanged,
    /// The name existed with different content and was overwritten. Deterministic
    /// naming makes this safe: same name means same logical object, and the latest
    /// emission of an aggregate supersedes the earlier one.
    Replaced,
}

#[async_trait]
pub(crate) trait ObjectStore: Send + Sync {
    async fn put(&self, name: &str, data: Bytes) -> Result<PutOutcome>;
    async fn get(&self, name: &str) -> Result<Option<Bytes>>;
}

/// Filesystem-backed object store: one file per object under a root directory,
/// written to a scratch file first and renamed into place so readers never observe a
/// partial object.
pub(crate) struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub(crate) async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::ObjectStore(format!("creating {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || Path::new(name)
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(Error::ObjectStore(format!("invalid object name {name:?}")));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, name: &str, data: Bytes) -> Result<PutOutcome> {
        let path = self.resolve(name)?;

        let existing = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(Error::ObjectStore(format!(
                    "reading {}: {e}",
                    path.display()
                )));
            }
        };
        if existing.as_ref() == Some(&data) {
            return Ok(PutOutcome::Unchanged);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::ObjectStore(format!("creating {}: {e}", parent.display())))?;
        }

        let scratch = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&scratch)
            .await
            .map_err(|e| Error::ObjectStore(format!("creating {}: {e}", scratch.display())))?;
        file.write_all(&data)
            .await
            .map_err(|e| Error::ObjectStore(format!("writing {}: {e}", scratch.display())))?;
        file.flush()
            .await
            .map_err(|e| Error::ObjectStore(format!("flushing {}: {e}", scratch.display())))?;
        tokio::fs::rename(&scratch, &path)
            .await
            .map_err(|e| Error::ObjectStore(format!("renaming to {}: {e}", path.display())))?;

        Ok(if existing.is_some() {
            PutOutcome::Replaced
        } else {
            PutOutcome::Created
        })
    }

    async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        let path = self.resolve(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::ObjectStore(format!(
                "reading {}: {e}",
                path.display()
            ))),
        }
    }
}

/// Map-backed object store for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
}

#[cfg(test)]
impl InMemoryObjectStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn object_count(&self) -> usize {
        self.objects.lock().len()
    }
}

#[cfg(test)]
#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, name: &str, data: Bytes) -> Result<PutOutcome> {
        let mut objects = self.objects.lock();
        match objects.insert(name.to_string(), data.clone()) {
            None => Ok(PutOutcome::Created),
            Some(previous) if previous == data => Ok(PutOutcome::Unchanged),
            Some(_) => Ok(PutOutcome::Replaced),
        }
    }

    async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        Ok(self.objects.lock().get(name).cloned())
    }
}
