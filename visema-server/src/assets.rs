// Avatar asset stores.
//
// An asset store turns an avatar reference (an object key) into raw image
// bytes. Every failure surfaces as `Error::AssetUnavailable`; the session
// manager then falls back to the placeholder background.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use visema_core::{AssetBackend, Error, RenderConfig, Result};

// Unreserved URL characters stay readable in object keys
const KEY_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const MAX_KEY_LEN: usize = 1024;

#[async_trait]
pub trait AssetStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch the object stored under `key`.
    async fn get(&self, key: &str) -> Result<Bytes>;
}

/// Build the store named by the configuration, if any.
pub fn from_config(config: &RenderConfig) -> Result<Option<Arc<dyn AssetStore>>> {
    let store: Arc<dyn AssetStore> = match &config.assets {
        AssetBackend::None => return Ok(None),
        AssetBackend::Directory { path } => {
            Arc::new(FsAssetStore::new(path, config.max_avatar_bytes))
        }
        AssetBackend::Http { base_url } => {
            Arc::new(HttpAssetStore::new(base_url, config.max_avatar_bytes)?)
        }
    };
    Ok(Some(store))
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::AssetUnavailable("invalid asset key length".to_string()));
    }
    if key.chars().any(|c| c.is_control()) {
        return Err(Error::AssetUnavailable(
            "asset key contains control characters".to_string(),
        ));
    }
    Ok(())
}

fn too_large(key: &str, size: u64, max: usize) -> Error {
    Error::AssetUnavailable(format!(
        "asset {} is {} bytes (max {})",
        key, size, max
    ))
}

/// Avatars stored as files under a root directory.
#[derive(Debug, Clone)]
pub struct FsAssetStore {
    root: PathBuf,
    max_bytes: usize,
}

impl FsAssetStore {
    pub fn new(root: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            root: root.into(),
            max_bytes,
        }
    }

    /// Resolve `key` below the root. Keys that would escape it are refused.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(Error::AssetUnavailable(format!(
                "asset key {:?} escapes the asset root",
                key
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl AssetStore for FsAssetStore {
    fn name(&self) -> &'static str {
        "directory"
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.resolve(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Error::AssetUnavailable(format!("{}: {}", key, e)))?;
        if !meta.is_file() {
            return Err(Error::AssetUnavailable(format!("{} is not a file", key)));
        }
        if meta.len() > self.max_bytes as u64 {
            return Err(too_large(key, meta.len(), self.max_bytes));
        }

        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::AssetUnavailable(format!("{}: {}", key, e)))?;
        debug!(key, bytes = data.len(), "read avatar from disk");
        Ok(Bytes::from(data))
    }
}

/// Avatars fetched with `GET <base_url>/<key>`.
#[derive(Debug, Clone)]
pub struct HttpAssetStore {
    client: Client,
    base_url: String,
    max_bytes: usize,
}

impl HttpAssetStore {
    pub fn new(base_url: &str, max_bytes: usize) -> Result<Self> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::Validation(format!(
                "asset base URL must be http(s): {}",
                base_url
            )));
        }
        if base_url.len() > 2048 {
            return Err(Error::Validation("asset base URL too long".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_bytes,
        })
    }

    pub fn object_url(&self, key: &str) -> String {
        let path = key
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| utf8_percent_encode(segment, KEY_SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl AssetStore for HttpAssetStore {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        check_key(key)?;
        let url = self.object_url(key);

        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::AssetUnavailable(format!("{}: {}", key, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::AssetUnavailable(format!(
                "{}: HTTP {}",
                key, status
            )));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_bytes as u64 {
                return Err(too_large(key, len, self.max_bytes));
            }
        }

        // chunked responses carry no length header; cap while reading
        let mut buf = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::AssetUnavailable(format!("{}: {}", key, e)))?
        {
            let total = buf.len() + chunk.len();
            if total > self.max_bytes {
                return Err(too_large(key, total as u64, self.max_bytes));
            }
            buf.extend_from_slice(&chunk);
        }
        let body = buf.freeze();
        debug!(key, bytes = body.len(), "fetched avatar over HTTP");
        Ok(body)
    }
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryAssetStore {
    objects: DashMap<String, Bytes>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.insert(key.into(), data.into());
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        check_key(key)?;
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::AssetUnavailable(format!("no such asset: {}", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("visema-assets-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_fs_store_reads_file() {
        let root = temp_root("read");
        std::fs::write(root.join("face.png"), b"pixels").unwrap();

        let store = FsAssetStore::new(&root, 1024);
        assert_eq!(store.get("face.png").await.unwrap(), Bytes::from_static(b"pixels"));
        assert!(matches!(
            store.get("missing.png").await,
            Err(Error::AssetUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_store_rejects_traversal() {
        let store = FsAssetStore::new(temp_root("traversal"), 1024);
        for key in ["../etc/passwd", "/etc/passwd", "a/../../b"] {
            assert!(
                matches!(store.get(key).await, Err(Error::AssetUnavailable(_))),
                "{} should be refused",
                key
            );
        }
    }

    #[tokio::test]
    async fn test_fs_store_enforces_size_limit() {
        let root = temp_root("limit");
        std::fs::write(root.join("big.png"), vec![0u8; 64]).unwrap();
        let store = FsAssetStore::new(&root, 16);
        let err = store.get("big.png").await.unwrap_err();
        assert!(err.to_string().contains("max 16"));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryAssetStore::new();
        store.insert("a", Bytes::from_static(b"1"));
        assert_eq!(store.get("a").await.unwrap(), Bytes::from_static(b"1"));
        assert!(store.get("b").await.is_err());
        assert!(store.get("").await.is_err());
    }

    #[test]
    fn test_object_url_encodes_segments() {
        let store = HttpAssetStore::new("https://cdn.example.com/avatars/", 1024).unwrap();
        assert_eq!(
            store.object_url("team a/face.png"),
            "https://cdn.example.com/avatars/team%20a/face.png"
        );
    }

    #[test]
    fn test_http_store_requires_http_url() {
        assert!(matches!(
            HttpAssetStore::new("ftp://example.com", 1024),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_from_config() {
        let mut config = RenderConfig::default();
        assert!(from_config(&config).unwrap().is_none());

        config.assets = AssetBackend::Directory {
            path: "/tmp".to_string(),
        };
        assert_eq!(from_config(&config).unwrap().unwrap().name(), "directory");
    }
}
