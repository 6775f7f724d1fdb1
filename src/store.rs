use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const STAGING_DIR: &str = ".staging";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upload stream error: {0}")]
    Stream(String),
    #[error("corrupt object metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Opaque unique object key. Freshly generated per write; never reused
/// within the operational lifetime of the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn generate() -> Self {
        ObjectKey(Uuid::new_v4().to_string())
    }

    /// Address an already committed object by its key text.
    pub fn new(key: impl Into<String>) -> Self {
        ObjectKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectMeta {
    content_type: Option<String>,
}

/// A committed object read back from the store.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: Option<String>,
}

/// Key-addressed object store backed by a directory.
///
/// Writes stream into a hidden staging file and are renamed into place only
/// after the payload stream completes, so a failed or aborted upload never
/// leaves a visible object. Objects are immutable once committed.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR)).await?;
        Ok(FsObjectStore { root })
    }

    fn object_path(&self, key: &ObjectKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    fn meta_path(&self, key: &ObjectKey) -> PathBuf {
        self.root.join(format!("{}.meta", key.as_str()))
    }

    fn staging_path(&self, key: &ObjectKey) -> PathBuf {
        self.root.join(STAGING_DIR).join(format!("{}.part", key.as_str()))
    }

    /// Stream `payload` into the object addressed by `key`, chunk by chunk.
    /// The whole body is never held in memory. Returns the number of bytes
    /// written once the object is durably committed.
    pub async fn put_stream<S, E>(
        &self,
        key: &ObjectKey,
        content_type: Option<String>,
        mut payload: S,
    ) -> Result<u64, StoreError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: fmt::Display,
    {
        let staging = self.staging_path(key);
        let result = match self.write_staged(&staging, &mut payload).await {
            Ok(written) => self.commit(key, content_type).await.map(|_| written),
            Err(e) => Err(e),
        };
        match result {
            Ok(written) => {
                log::info!("stored object {} ({} bytes)", key, written);
                Ok(written)
            }
            Err(e) => {
                // no partial object or sidecar stays behind on any failure
                let _ = fs::remove_file(&staging).await;
                let _ = fs::remove_file(self.meta_path(key)).await;
                Err(e)
            }
        }
    }

    async fn commit(&self, key: &ObjectKey, content_type: Option<String>) -> Result<(), StoreError> {
        let meta = ObjectMeta { content_type };
        fs::write(self.meta_path(key), serde_json::to_vec(&meta)?).await?;
        // rename last: the object only becomes visible fully written
        fs::rename(self.staging_path(key), self.object_path(key)).await?;
        Ok(())
    }

    async fn write_staged<S, E>(&self, staging: &Path, payload: &mut S) -> Result<u64, StoreError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: fmt::Display,
    {
        let mut file = fs::File::create(staging).await?;
        let mut written = 0u64;
        while let Some(chunk) = payload.next().await {
            let chunk = chunk.map_err(|e| StoreError::Stream(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Read a committed object back. Returns `None` for unknown keys.
    pub async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>, StoreError> {
        let data = match fs::read(self.object_path(key)).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let content_type = match fs::read(self.meta_path(key)).await {
            Ok(raw) => serde_json::from_slice::<ObjectMeta>(&raw)?.content_type,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Some(StoredObject { data, content_type }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, StoreError>> + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn identical_payloads_get_distinct_keys_and_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path()).await.unwrap();

        let k1 = ObjectKey::generate();
        let k2 = ObjectKey::generate();
        assert_ne!(k1, k2);

        store
            .put_stream(&k1, Some("text/plain".into()), chunks(&["same ", "bytes"]))
            .await
            .unwrap();
        store
            .put_stream(&k2, Some("text/plain".into()), chunks(&["same ", "bytes"]))
            .await
            .unwrap();

        let o1 = store.get(&k1).await.unwrap().unwrap();
        let o2 = store.get(&k2).await.unwrap().unwrap();
        assert_eq!(&o1.data[..], b"same bytes");
        assert_eq!(&o2.data[..], b"same bytes");
        assert_eq!(o1.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn content_type_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path()).await.unwrap();

        let key = ObjectKey::generate();
        let written = store.put_stream(&key, None, chunks(&["payload"])).await.unwrap();
        assert_eq!(written, 7);

        let obj = store.get(&key).await.unwrap().unwrap();
        assert_eq!(obj.content_type, None);
    }

    #[tokio::test]
    async fn aborted_stream_leaves_no_visible_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path()).await.unwrap();

        let key = ObjectKey::generate();
        let payload = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(StoreError::Stream("connection reset".into())),
        ]);
        let err = store.put_stream(&key, None, payload).await;
        assert!(err.is_err());

        assert!(store.get(&key).await.unwrap().is_none());
        assert!(!store.staging_path(&key).exists());
    }

    #[tokio::test]
    async fn failed_commit_cleans_up_staging_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path()).await.unwrap();

        // a directory squatting on the object path makes the rename fail
        let key = ObjectKey::generate();
        fs::create_dir(store.object_path(&key)).await.unwrap();

        let res = store
            .put_stream(&key, Some("text/plain".into()), chunks(&["data"]))
            .await;
        assert!(res.is_err());
        assert!(!store.staging_path(&key).exists());
        assert!(!store.meta_path(&key).exists());
    }

    #[tokio::test]
    async fn unknown_key_resolves_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path()).await.unwrap();
        assert!(store.get(&ObjectKey::generate()).await.unwrap().is_none());
    }
}
