use crate::error::{ConvertError, ConvertResult};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::ObjectStoreExt;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// StorageBackend trait
// ---------------------------------------------------------------------------

/// Async key-value storage abstraction over the Zarr store layout.
///
/// Implementations can target local filesystem, S3, GCS, Azure, or in-memory
/// stores. Keys encode the POSIX-like hierarchy Zarr V2 expects
/// (`<group>/.zgroup`, `<group>/<array>/.zarray`, chunk keys `i.j.k`).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch the contents at `path`.
    /// Returns `Ok(None)` when the key does not exist (rather than an error).
    async fn get(&self, path: &str) -> ConvertResult<Option<Bytes>>;

    /// Write the contents at `path`, replacing any existing value.
    async fn put(&self, path: &str, data: Bytes) -> ConvertResult<()>;

    /// Remove the key at `path`. Removing an absent key is not an error.
    async fn delete(&self, path: &str) -> ConvertResult<()>;

    /// List immediate children under `prefix`.
    async fn list(&self, prefix: &str) -> ConvertResult<Vec<String>>;

    /// List every key under `prefix`, recursively, relative to the store root.
    async fn list_prefix(&self, prefix: &str) -> ConvertResult<Vec<String>>;

    /// Remove every key under `prefix`. Used to drop superseded stores.
    async fn delete_prefix(&self, prefix: &str) -> ConvertResult<()> {
        for key in self.list_prefix(prefix).await? {
            self.delete(&key).await?;
        }
        Ok(())
    }

    /// Join a base path with a relative segment.
    fn join(&self, base: &str, segment: &str) -> String;
}

// ---------------------------------------------------------------------------
// LocalBackend  (tokio::fs)
// ---------------------------------------------------------------------------

/// Simple local-filesystem backend using `tokio::fs`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn get(&self, path: &str) -> ConvertResult<Option<Bytes>> {
        let full = self.resolve(path);
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConvertError::Storage(format!(
                "Failed to read {}: {e}",
                full.display()
            ))),
        }
    }

    async fn put(&self, path: &str, data: Bytes) -> ConvertResult<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ConvertError::Storage(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        tokio::fs::write(&full, &data).await.map_err(|e| {
            ConvertError::Storage(format!("Failed to write {}: {e}", full.display()))
        })
    }

    async fn delete(&self, path: &str) -> ConvertResult<()> {
        let full = self.resolve(path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConvertError::Storage(format!(
                "Failed to delete {}: {e}",
                full.display()
            ))),
        }
    }

    async fn list(&self, prefix: &str) -> ConvertResult<Vec<String>> {
        let dir = self.resolve(prefix);
        let mut entries = Vec::new();
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => {
                return Err(ConvertError::Storage(format!(
                    "Failed to list {}: {e}",
                    dir.display()
                )));
            }
        };
        while let Some(entry) = reader.next_entry().await.map_err(|e| {
            ConvertError::Storage(format!("Failed to read entry in {}: {e}", dir.display()))
        })? {
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }
        Ok(entries)
    }

    async fn list_prefix(&self, prefix: &str) -> ConvertResult<Vec<String>> {
        let root = self.resolve(prefix);
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let mut reader = tokio::fs::read_dir(&dir).await.map_err(|e| {
                ConvertError::Storage(format!("Failed to list {}: {e}", dir.display()))
            })?;
            while let Some(entry) = reader.next_entry().await.map_err(|e| {
                ConvertError::Storage(format!("Failed to read entry in {}: {e}", dir.display()))
            })? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    keys.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn join(&self, base: &str, segment: &str) -> String {
        if base.is_empty() {
            segment.to_string()
        } else {
            let p = Path::new(base).join(segment);
            p.to_string_lossy().into_owned()
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectStoreBackend  (wraps object_store crate)
// ---------------------------------------------------------------------------

/// Backend that wraps any [`object_store::ObjectStore`] implementation.
pub struct ObjectStoreBackend {
    store: Box<dyn object_store::ObjectStore>,
    prefix: String,
}

impl ObjectStoreBackend {
    pub fn new(store: Box<dyn object_store::ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn full_path(&self, path: &str) -> object_store::path::Path {
        if self.prefix.is_empty() {
            object_store::path::Path::from(path)
        } else {
            object_store::path::Path::from(format!("{}/{}", self.prefix, path))
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> ConvertResult<Option<Bytes>> {
        let location = self.full_path(path);
        match self.store.get(&location).await {
            Ok(result) => {
                let data = result.bytes().await.map_err(|e| {
                    ConvertError::Storage(format!("Failed to read bytes from {path}: {e}"))
                })?;
                Ok(Some(data))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(ConvertError::Storage(format!(
                "Object store error for {path}: {e}"
            ))),
        }
    }

    async fn put(&self, path: &str, data: Bytes) -> ConvertResult<()> {
        let location = self.full_path(path);
        self.store
            .put(&location, data.into())
            .await
            .map_err(|e| ConvertError::Storage(format!("Object store put error for {path}: {e}")))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> ConvertResult<()> {
        let location = self.full_path(path);
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(ConvertError::Storage(format!(
                "Object store delete error for {path}: {e}"
            ))),
        }
    }

    async fn list(&self, prefix: &str) -> ConvertResult<Vec<String>> {
        let location = self.full_path(prefix);
        let listing = self
            .store
            .list_with_delimiter(Some(&location))
            .await
            .map_err(|e| ConvertError::Storage(format!("Object store list error for {prefix}: {e}")))?;
        let mut entries: Vec<String> = listing
            .common_prefixes
            .iter()
            .chain(listing.objects.iter().map(|meta| &meta.location))
            .filter_map(|p| p.parts().last().map(|part| part.as_ref().to_string()))
            .collect();
        entries.sort();
        Ok(entries)
    }

    async fn list_prefix(&self, prefix: &str) -> ConvertResult<Vec<String>> {
        use futures::TryStreamExt;
        let location = self.full_path(prefix);
        let mut keys = Vec::new();
        let mut stream = self.store.list(Some(&location));
        while let Some(meta) = stream.try_next().await.map_err(|e| {
            ConvertError::Storage(format!("Object store list error for {prefix}: {e}"))
        })? {
            let key = meta.location.to_string();
            let relative = if self.prefix.is_empty() {
                key
            } else {
                key.strip_prefix(&format!("{}/", self.prefix))
                    .map(|s| s.to_string())
                    .unwrap_or(key)
            };
            keys.push(relative);
        }
        keys.sort();
        Ok(keys)
    }

    fn join(&self, base: &str, segment: &str) -> String {
        if base.is_empty() {
            segment.to_string()
        } else {
            format!("{base}/{segment}")
        }
    }
}
